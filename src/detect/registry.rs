use std::collections::BTreeMap;

use anyhow::{anyhow, Result};

use super::backend::{DetectionCapability, DetectorBackend};
use super::backends::StubBackend;
use crate::config::DetectorSettings;

type BackendFactory = Box<dyn Fn() -> Result<Box<dyn DetectorBackend>> + Send + Sync>;

struct Entry {
    factory: BackendFactory,
    capabilities: Vec<DetectionCapability>,
}

/// Registry of detector backend constructors.
///
/// Every stream gets its own backend instance (`infer` takes `&mut self`), so
/// the registry hands out fresh boxes instead of shared handles.
pub struct BackendRegistry {
    backends: BTreeMap<String, Entry>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: BTreeMap::new(),
            default_name: None,
        }
    }

    /// Register a constructor. The first registered backend becomes the default.
    pub fn register<F>(&mut self, name: &str, capabilities: &[DetectionCapability], factory: F)
    where
        F: Fn() -> Result<Box<dyn DetectorBackend>> + Send + Sync + 'static,
    {
        if self.default_name.is_none() {
            self.default_name = Some(name.to_string());
        }
        self.backends.insert(
            name.to_string(),
            Entry {
                factory: Box::new(factory),
                capabilities: capabilities.to_vec(),
            },
        );
    }

    /// Set default backend by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.backends.contains_key(name) {
            return Err(anyhow!("backend '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default_name.as_deref()
    }

    /// Build a backend by name.
    pub fn create(&self, name: &str) -> Result<Box<dyn DetectorBackend>> {
        let entry = self
            .backends
            .get(name)
            .ok_or_else(|| anyhow!("backend '{}' not registered", name))?;
        (entry.factory)()
    }

    /// Build the default backend.
    pub fn create_default(&self) -> Result<Box<dyn DetectorBackend>> {
        let name = self
            .default_name
            .as_deref()
            .ok_or_else(|| anyhow!("no detector backend registered"))?;
        self.create(name)
    }

    /// List registered backends.
    pub fn list(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    /// Build a backend that supports the requested capability.
    ///
    /// Prefers the default backend when it supports the capability.
    pub fn create_for_capability(
        &self,
        capability: DetectionCapability,
    ) -> Result<Box<dyn DetectorBackend>> {
        if let Some(name) = self.default_name.as_deref() {
            if let Some(entry) = self.backends.get(name) {
                if entry.capabilities.contains(&capability) {
                    return (entry.factory)();
                }
            }
        }

        for entry in self.backends.values() {
            if entry.capabilities.contains(&capability) {
                return (entry.factory)();
            }
        }

        Err(anyhow!(
            "no registered backend supports capability {:?}",
            capability
        ))
    }
}

/// Registry with every backend compiled into this build, configured from
/// `settings`. The configured backend becomes the default.
pub fn builtin_registry(settings: &DetectorSettings) -> Result<BackendRegistry> {
    let mut registry = BackendRegistry::new();
    registry.register("stub", &[DetectionCapability::ObjectDetection], || {
        Ok(Box::new(StubBackend::new()))
    });

    #[cfg(feature = "backend-tract")]
    {
        if let Some(model_path) = settings.model_path.clone() {
            let input_size = settings.input_size;
            let class_names = if settings.class_names.is_empty() {
                super::labels::coco_class_names()
            } else {
                settings.class_names.clone()
            };
            registry.register("tract", &[DetectionCapability::ObjectDetection], move || {
                Ok(Box::new(super::backends::TractBackend::new(
                    &model_path,
                    input_size,
                    class_names.clone(),
                )?))
            });
        }
    }

    registry.set_default(&settings.backend).map_err(|_| {
        anyhow!(
            "detector backend '{}' is not available in this build (have: {})",
            settings.backend,
            registry.list().join(", ")
        )
    })?;
    Ok(registry)
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{ScriptedBackend, StubBackend};

    #[test]
    fn first_registered_is_default() -> Result<()> {
        let mut registry = BackendRegistry::new();
        registry.register("stub", &[DetectionCapability::ObjectDetection], || {
            Ok(Box::new(StubBackend::new()))
        });
        registry.register("scripted", &[DetectionCapability::ObjectDetection], || {
            Ok(Box::new(ScriptedBackend::new(Vec::new())))
        });

        assert_eq!(registry.default_name(), Some("stub"));
        assert_eq!(registry.create_default()?.name(), "stub");
        registry.set_default("scripted")?;
        assert_eq!(registry.create_default()?.name(), "scripted");
        assert!(registry.set_default("missing").is_err());
        assert_eq!(registry.list(), vec!["scripted", "stub"]);
        Ok(())
    }

    #[test]
    fn capability_lookup_skips_unsupported_default() {
        let mut registry = BackendRegistry::new();
        registry.register("stub", &[DetectionCapability::ObjectDetection], || {
            Ok(Box::new(StubBackend::new()))
        });
        assert!(registry
            .create_for_capability(DetectionCapability::ObjectDetection)
            .is_ok());
        assert!(registry
            .create_for_capability(DetectionCapability::Classification)
            .is_err());
    }

    #[test]
    fn builtin_registry_defaults_to_configured_backend() -> Result<()> {
        let mut settings = DetectorSettings::default();
        settings.backend = "stub".to_string();
        let registry = builtin_registry(&settings)?;
        assert_eq!(registry.default_name(), Some("stub"));
        assert_eq!(registry.create_default()?.name(), "stub");

        settings.backend = "yolo-cuda".to_string();
        assert!(builtin_registry(&settings).is_err());
        Ok(())
    }
}
