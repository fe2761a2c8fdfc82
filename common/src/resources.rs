use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Vector de cantidades con nombre (cores, memoria, disco, ...).
///
/// `None` = no especificado. Memoria y disco en MB, wall_time en segundos.
/// Cantidades que no tienen campo propio van en `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cores: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpus: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wall_time: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, f64>,
}

impl ResourceSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: f64) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        match name {
            "cores" => self.cores,
            "memory" => self.memory,
            "disk" => self.disk,
            "gpus" => self.gpus,
            "wall_time" => self.wall_time,
            other => self.extra.get(other).copied(),
        }
    }

    pub fn set(&mut self, name: &str, value: f64) {
        match name {
            "cores" => self.cores = Some(value),
            "memory" => self.memory = Some(value),
            "disk" => self.disk = Some(value),
            "gpus" => self.gpus = Some(value),
            "wall_time" => self.wall_time = Some(value),
            other => {
                self.extra.insert(other.to_string(), value);
            }
        }
    }

    /// Cantidades especificadas, en orden estable.
    pub fn quantities(&self) -> Vec<(String, f64)> {
        let fixed = [
            ("cores", self.cores),
            ("memory", self.memory),
            ("disk", self.disk),
            ("gpus", self.gpus),
            ("wall_time", self.wall_time),
        ];

        let mut out: Vec<(String, f64)> = fixed
            .iter()
            .filter_map(|(name, v)| v.map(|v| (name.to_string(), v)))
            .collect();

        for (k, v) in &self.extra {
            out.push((k.clone(), *v));
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.quantities().is_empty()
    }

    /// Completa lo no especificado con `defaults`. Lo especificado gana siempre.
    pub fn fill_from(&self, defaults: &ResourceSummary) -> ResourceSummary {
        let mut out = self.clone();
        for (name, value) in defaults.quantities() {
            if out.get(&name).is_none() {
                out.set(&name, value);
            }
        }
        out
    }

    /// true si cada cantidad pedida cabe en `available`.
    /// Lo que `available` no especifica se considera ilimitado.
    pub fn fits_within(&self, available: &ResourceSummary) -> bool {
        self.quantities()
            .iter()
            .all(|(name, need)| available.get(name).map_or(true, |have| *need <= have))
    }

    /// Nombres de las cantidades en las que `measured` superó esta asignación.
    pub fn exceeded_by(&self, measured: &ResourceSummary) -> Vec<String> {
        measured
            .quantities()
            .into_iter()
            .filter(|(name, used)| self.get(name).map_or(false, |limit| *used > limit))
            .map(|(name, _)| name)
            .collect()
    }

    /// Máximo cantidad por cantidad (para estadísticas por categoría).
    pub fn merge_max(&mut self, other: &ResourceSummary) {
        for (name, value) in other.quantities() {
            match self.get(&name) {
                Some(current) if current >= value => {}
                _ => self.set(&name, value),
            }
        }
    }

    /// Resta `used` de este total, sin bajar de cero.
    pub fn saturating_sub(&self, used: &ResourceSummary) -> ResourceSummary {
        let mut out = self.clone();
        for (name, value) in self.quantities() {
            if let Some(u) = used.get(&name) {
                out.set(&name, (value - u).max(0.0));
            }
        }
        out
    }

    /// Suma cantidad por cantidad.
    pub fn add(&mut self, other: &ResourceSummary) {
        for (name, value) in other.quantities() {
            let current = self.get(&name).unwrap_or(0.0);
            self.set(&name, current + value);
        }
    }
}

/// Asignación de un intento: lo pedido, completado con los valores por defecto
/// de la categoría y, en último lugar, con el worker entero.
pub fn allocate(
    requested: &ResourceSummary,
    category_defaults: &ResourceSummary,
    worker_available: &ResourceSummary,
) -> ResourceSummary {
    requested
        .fill_from(category_defaults)
        .fill_from(worker_available)
}

/// Servicio externo de estimación de recursos por categoría.
pub trait ResourceEstimator {
    /// Valores por defecto para tareas de `category` que no piden algo.
    fn defaults_for(&self, category: &str) -> ResourceSummary;

    /// Registra lo medido en un intento terminado.
    fn observe(&mut self, category: &str, measured: &ResourceSummary);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_from_respeta_lo_especificado() {
        let req = ResourceSummary::new().with("cores", 2.0);
        let def = ResourceSummary::new().with("cores", 1.0).with("memory", 512.0);

        let out = req.fill_from(&def);
        assert_eq!(out.cores, Some(2.0));
        assert_eq!(out.memory, Some(512.0));
        assert_eq!(out.disk, None);
    }

    #[test]
    fn allocate_usa_worker_entero_si_no_hay_nada() {
        let worker = ResourceSummary::new()
            .with("cores", 8.0)
            .with("memory", 16000.0);
        let out = allocate(&ResourceSummary::new(), &ResourceSummary::new(), &worker);
        assert_eq!(out, worker);
    }

    #[test]
    fn fits_within_trata_lo_no_especificado_como_ilimitado() {
        let req = ResourceSummary::new().with("cores", 4.0).with("gpus", 1.0);
        let worker = ResourceSummary::new().with("cores", 4.0);
        assert!(req.fits_within(&worker));

        let small = ResourceSummary::new().with("cores", 2.0);
        assert!(!req.fits_within(&small));
    }

    #[test]
    fn exceeded_by_lista_cantidades_superadas() {
        let alloc = ResourceSummary::new().with("cores", 1.0).with("memory", 100.0);
        let measured = ResourceSummary::new()
            .with("cores", 0.9)
            .with("memory", 250.0)
            .with("disk", 9999.0);
        assert_eq!(alloc.exceeded_by(&measured), vec!["memory".to_string()]);
    }

    #[test]
    fn extra_quantities_by_name() {
        let mut r = ResourceSummary::new();
        r.set("bandwidth", 10.0);
        assert_eq!(r.get("bandwidth"), Some(10.0));
        assert_eq!(r.quantities(), vec![("bandwidth".to_string(), 10.0)]);
    }

    #[test]
    fn merge_max_y_saturating_sub() {
        let mut a = ResourceSummary::new().with("memory", 100.0);
        a.merge_max(&ResourceSummary::new().with("memory", 50.0).with("cores", 2.0));
        assert_eq!(a.memory, Some(100.0));
        assert_eq!(a.cores, Some(2.0));

        let free = a.saturating_sub(&ResourceSummary::new().with("cores", 3.0));
        assert_eq!(free.cores, Some(0.0));
        assert_eq!(free.memory, Some(100.0));
    }
}
