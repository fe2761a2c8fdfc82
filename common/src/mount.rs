use serde::{Deserialize, Serialize};
use std::{
    collections::{hash_map::DefaultHasher, HashSet},
    fmt,
    hash::{Hash, Hasher},
    path::{Component, Path},
};

use crate::error::TaskError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountSide {
    Input,
    Output,
}

impl fmt::Display for MountSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountSide::Input => f.write_str("input"),
            MountSide::Output => f.write_str("output"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountFlags {
    /// El worker puede dejar el archivo en su cache para otras tareas
    #[serde(default)]
    pub cache: bool,
    /// Sólo sirve un worker que ya tenga este archivo
    #[serde(default)]
    pub fixed_location: bool,
    /// Salida observada: se trunca antes de cada despacho
    #[serde(default)]
    pub watch: bool,
}

impl MountFlags {
    pub fn cached() -> Self {
        Self {
            cache: true,
            ..Self::default()
        }
    }

    pub fn fixed_location() -> Self {
        Self {
            fixed_location: true,
            ..Self::default()
        }
    }

    pub fn watched() -> Self {
        Self {
            watch: true,
            ..Self::default()
        }
    }
}

/// Objeto lógico que se monta en el sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileObject {
    /// Archivo en el sistema de archivos del manager (o compartido con los workers)
    LocalFile {
        path: String,
        #[serde(default)]
        size: Option<u64>,
    },
    Url {
        url: String,
    },
    Buffer {
        data: Vec<u8>,
    },
    /// Archivo producido por una mini-tarea ejecutada en el worker
    MiniTask {
        command_line: String,
        output_name: String,
    },
}

impl FileObject {
    pub fn local(path: impl Into<String>) -> Self {
        FileObject::LocalFile {
            path: path.into(),
            size: None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FileObject::LocalFile { .. } => "file",
            FileObject::Url { .. } => "url",
            FileObject::Buffer { .. } => "buffer",
            FileObject::MiniTask { .. } => "mini_task",
        }
    }

    /// Nombre con el que el worker identifica este objeto en su cache.
    pub fn cache_name(&self) -> String {
        match self {
            FileObject::LocalFile { path, .. } => format!("file:{}", path),
            FileObject::Url { url } => format!("url:{}", url),
            FileObject::Buffer { data } => {
                let mut hasher = DefaultHasher::new();
                data.hash(&mut hasher);
                format!("buffer:{:016x}", hasher.finish())
            }
            FileObject::MiniTask {
                command_line,
                output_name,
            } => {
                let mut hasher = DefaultHasher::new();
                command_line.hash(&mut hasher);
                output_name.hash(&mut hasher);
                format!("task:{:016x}", hasher.finish())
            }
        }
    }

    /// Tamaño en bytes si se conoce sin hacer I/O.
    pub fn size(&self) -> Option<u64> {
        match self {
            FileObject::LocalFile { size, .. } => *size,
            FileObject::Buffer { data } => Some(data.len() as u64),
            _ => None,
        }
    }

    /// Texto corto para logs y exportación.
    pub fn source(&self) -> String {
        match self {
            FileObject::LocalFile { path, .. } => path.clone(),
            FileObject::Url { url } => url.clone(),
            FileObject::Buffer { data } => format!("<{} bytes>", data.len()),
            FileObject::MiniTask { command_line, .. } => command_line.clone(),
        }
    }
}

/// Un archivo atado a una ruta relativa del sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub file: FileObject,
    pub remote_name: String,
    pub side: MountSide,
    #[serde(default)]
    pub flags: MountFlags,
}

impl Mount {
    /// Valida la ruta remota y que el tipo de archivo tenga sentido para el lado.
    pub fn new(
        side: MountSide,
        file: FileObject,
        remote_name: impl Into<String>,
        flags: MountFlags,
    ) -> Result<Self, TaskError> {
        let remote_name = remote_name.into();
        validate_remote_name(&remote_name)?;

        let invalid = |reason: &str| TaskError::InvalidMount {
            remote_name: remote_name.clone(),
            reason: reason.to_string(),
        };

        match (&file, side) {
            (FileObject::LocalFile { path, .. }, _) if path.is_empty() => {
                return Err(invalid("ruta local vacía"));
            }
            (FileObject::Url { url }, MountSide::Input) if url.is_empty() => {
                return Err(invalid("url vacía"));
            }
            (FileObject::LocalFile { .. }, MountSide::Output) => {}
            (_, MountSide::Output) => {
                return Err(invalid("las salidas sólo pueden ser archivos locales"));
            }
            _ => {}
        }

        if flags.watch && side == MountSide::Input {
            return Err(invalid("watch sólo aplica a salidas"));
        }

        Ok(Self {
            file,
            remote_name,
            side,
            flags,
        })
    }
}

fn validate_remote_name(remote_name: &str) -> Result<(), TaskError> {
    let reason = if remote_name.trim().is_empty() {
        Some("ruta remota vacía")
    } else if Path::new(remote_name).is_absolute() {
        Some("la ruta remota debe ser relativa al sandbox")
    } else if Path::new(remote_name)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        Some("la ruta remota no puede salir del sandbox")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(TaskError::InvalidMount {
            remote_name: remote_name.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

/// Primera ruta remota repetida dentro de una lista de mounts.
pub fn find_duplicate(mounts: &[Mount]) -> Option<&str> {
    let mut seen = HashSet::new();
    mounts
        .iter()
        .map(|m| m.remote_name.as_str())
        .find(|name| !seen.insert(*name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(remote: &str) -> Mount {
        Mount::new(
            MountSide::Input,
            FileObject::local("/tmp/in.txt"),
            remote,
            MountFlags::default(),
        )
        .unwrap()
    }

    #[test]
    fn rechaza_rutas_remotas_invalidas() {
        for bad in ["", "   ", "/etc/passwd", "../fuera", "a/../../b"] {
            let err = Mount::new(
                MountSide::Input,
                FileObject::local("/tmp/x"),
                bad,
                MountFlags::default(),
            )
            .unwrap_err();
            assert!(matches!(err, TaskError::InvalidMount { .. }), "{bad:?}");
        }
    }

    #[test]
    fn outputs_must_be_local_files() {
        let err = Mount::new(
            MountSide::Output,
            FileObject::Url {
                url: "http://example.com/x".into(),
            },
            "x",
            MountFlags::default(),
        )
        .unwrap_err();
        assert!(matches!(err, TaskError::InvalidMount { .. }));

        let ok = Mount::new(
            MountSide::Output,
            FileObject::local("/data/out/x"),
            "x",
            MountFlags::watched(),
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn watch_en_entrada_es_invalido() {
        let err = Mount::new(
            MountSide::Input,
            FileObject::local("/tmp/x"),
            "x",
            MountFlags::watched(),
        )
        .unwrap_err();
        assert!(matches!(err, TaskError::InvalidMount { .. }));
    }

    #[test]
    fn find_duplicate_detecta_repetidos() {
        let mounts = vec![input("a"), input("b"), input("a")];
        assert_eq!(find_duplicate(&mounts), Some("a"));
        assert_eq!(find_duplicate(&mounts[..2]), None);
    }

    #[test]
    fn buffers_iguales_comparten_cache_name() {
        let a = FileObject::Buffer {
            data: b"hola".to_vec(),
        };
        let b = FileObject::Buffer {
            data: b"hola".to_vec(),
        };
        assert_eq!(a.cache_name(), b.cache_name());
        assert_eq!(a.size(), Some(4));
        assert_eq!(FileObject::local("/x").cache_name(), "file:/x");
    }
}
