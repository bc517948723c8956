use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use super::backend::{DetectorBackend, SharedBackend};
use super::backends::{CpuBackend, StubBackend};
use crate::config::DetectorSettings;

/// Registry of detector backends, keyed by backend name.
pub struct BackendRegistry {
    backends: HashMap<String, SharedBackend>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            default_name: None,
        }
    }

    /// Registry with every backend the settings allow, defaulting to
    /// `settings.backend`.
    pub fn from_settings(settings: &DetectorSettings) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(CpuBackend::default());
        registry.register(StubBackend::new());

        #[cfg(feature = "backend-tract")]
        if let Some(model_path) = &settings.model_path {
            let backend = super::backends::TractBackend::new(model_path, settings.input_size)?
                .with_thresholds(settings.confidence_threshold, settings.iou_threshold);
            registry.register(backend);
        }

        registry.set_default(&settings.backend)?;
        Ok(registry)
    }

    /// Register a backend. The first registered backend becomes the default.
    pub fn register<B: DetectorBackend + 'static>(&mut self, backend: B) {
        let name = backend.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.backends.insert(name, Arc::new(Mutex::new(backend)));
    }

    /// Set default backend by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.backends.contains_key(name) {
            return Err(anyhow!(
                "detector backend '{}' not registered (available: {})",
                name,
                self.list().join(", ")
            ));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    /// Get backend by name.
    pub fn get(&self, name: &str) -> Option<SharedBackend> {
        self.backends.get(name).cloned()
    }

    /// Get default backend.
    pub fn default_backend(&self) -> Option<SharedBackend> {
        self.default_name.as_ref().and_then(|name| self.get(name))
    }

    /// List registered backends, sorted by name.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    /// Warm up the default backend and hand it out.
    pub fn prepare_default(&self) -> Result<SharedBackend> {
        let backend = self
            .default_backend()
            .ok_or_else(|| anyhow!("no detector backend registered"))?;
        {
            let mut guard = backend
                .lock()
                .map_err(|_| anyhow!("detector backend lock poisoned"))?;
            guard.warm_up()?;
            log::info!("detector backend '{}' ready", guard.name());
        }
        Ok(backend)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(backend: &str) -> DetectorSettings {
        DetectorSettings {
            backend: backend.to_string(),
            ..DetectorSettings::default()
        }
    }

    #[test]
    fn first_registered_backend_is_default() {
        let mut registry = BackendRegistry::new();
        registry.register(StubBackend::new());
        registry.register(CpuBackend::default());
        let backend = registry.default_backend().unwrap();
        assert_eq!(backend.lock().unwrap().name(), "stub");
    }

    #[test]
    fn from_settings_selects_requested_backend() {
        let registry = BackendRegistry::from_settings(&settings("stub")).unwrap();
        assert_eq!(registry.list(), vec!["cpu".to_string(), "stub".to_string()]);
        let backend = registry.prepare_default().unwrap();
        assert_eq!(backend.lock().unwrap().name(), "stub");
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let err = BackendRegistry::from_settings(&settings("yolo-remote"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("yolo-remote"));
    }
}
