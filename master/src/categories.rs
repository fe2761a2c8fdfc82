use std::collections::HashMap;

use common::{ResourceEstimator, ResourceSummary};
use tracing::debug;

/// Estimador por categoría. Los defaults son sólo los configurados; lo medido
/// se guarda como estadística y nunca se convierte en límite de asignación.
#[derive(Debug, Default)]
pub struct CategoryStats {
    configured: HashMap<String, ResourceSummary>,
    max_seen: HashMap<String, ResourceSummary>,
    completed: HashMap<String, u64>,
}

impl CategoryStats {
    pub fn new(configured: HashMap<String, ResourceSummary>) -> Self {
        Self {
            configured,
            ..Self::default()
        }
    }

    pub fn completed(&self, category: &str) -> u64 {
        self.completed.get(category).copied().unwrap_or(0)
    }
}

impl ResourceEstimator for CategoryStats {
    fn defaults_for(&self, category: &str) -> ResourceSummary {
        self.configured.get(category).cloned().unwrap_or_default()
    }

    fn observe(&mut self, category: &str, measured: &ResourceSummary) {
        *self.completed.entry(category.to_string()).or_insert(0) += 1;
        let entry = self.max_seen.entry(category.to_string()).or_default();
        entry.merge_max(measured);
        debug!(category, max = ?entry, "máximo de categoría actualizado");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lo_medido_no_cambia_los_defaults() {
        let mut cfg = HashMap::new();
        cfg.insert("sim".to_string(), ResourceSummary::new().with("cores", 2.0));
        let mut stats = CategoryStats::new(cfg);

        stats.observe(
            "sim",
            &ResourceSummary::new()
                .with("cores", 6.0)
                .with("memory", 900.0)
                .with("wall_time", 12.0),
        );
        stats.observe("sim", &ResourceSummary::new().with("memory", 300.0));

        let d = stats.defaults_for("sim");
        assert_eq!(d.cores, Some(2.0));
        assert_eq!(d.memory, None);
        assert_eq!(d.wall_time, None);

        let seen = &stats.max_seen["sim"];
        assert_eq!(seen.memory, Some(900.0));
        assert_eq!(seen.cores, Some(6.0));
        assert_eq!(stats.completed("sim"), 2);
    }

    #[test]
    fn categoria_desconocida_no_tiene_defaults() {
        let stats = CategoryStats::default();
        assert!(stats.defaults_for("otra").is_empty());
    }
}
