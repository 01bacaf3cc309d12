use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use tether_config::{DebuggerConfig, TetherConfig};
use tether_native::NativeDebuggerConfig;
use tether_srcmap::PositionMapStore;

use crate::catalog::BreakpointCatalog;

/// State shared by every session served by one adapter process.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    maps: Arc<PositionMapStore>,
    catalog: Arc<BreakpointCatalog>,
    debugger: NativeDebuggerConfig,
    next_session: Arc<AtomicU64>,
}

impl AdapterContext {
    pub fn new(maps: Arc<PositionMapStore>, catalog: Arc<BreakpointCatalog>, debugger: NativeDebuggerConfig) -> Self {
        Self {
            maps,
            catalog,
            debugger,
            next_session: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Build a context from `config`, loading the configured map directory if any.
    pub fn from_config(config: &TetherConfig) -> tether_srcmap::Result<Self> {
        let maps = PositionMapStore::new();
        if let Some(dir) = &config.maps.dir {
            let loaded = maps.load(dir)?;
            tracing::info!(dir = %dir.display(), loaded, "loaded position maps");
        }
        Ok(Self::new(
            Arc::new(maps),
            Arc::new(BreakpointCatalog::new()),
            native_config(&config.debugger),
        ))
    }

    pub fn maps(&self) -> &Arc<PositionMapStore> {
        &self.maps
    }

    pub fn catalog(&self) -> &Arc<BreakpointCatalog> {
        &self.catalog
    }

    pub fn debugger_config(&self) -> &NativeDebuggerConfig {
        &self.debugger
    }

    pub(crate) fn next_session_id(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }
}

pub fn native_config(config: &DebuggerConfig) -> NativeDebuggerConfig {
    NativeDebuggerConfig {
        executable: config.path.clone(),
        extra_args: config.args.clone(),
        announce_timeout: config.announce_timeout(),
        request_timeout: config.request_timeout(),
        run_control_timeout: config.run_control_timeout(),
        reap_timeout: config.reap_timeout(),
        exit_timeout: config.exit_timeout(),
        ..NativeDebuggerConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn debugger_section_maps_onto_native_config() {
        let config = TetherConfig::load_from_str(
            "[debugger]\npath = \"/opt/dlv\"\nargs = [\"--log\"]\nrun_control_timeout_ms = 1500\n",
        )
        .unwrap();
        let native = native_config(&config.debugger);
        assert_eq!(native.executable, std::path::PathBuf::from("/opt/dlv"));
        assert_eq!(native.extra_args, vec!["--log".to_string()]);
        assert_eq!(native.run_control_timeout, Duration::from_millis(1500));
        assert_eq!(native.announce_timeout, Duration::from_secs(5));
    }

    #[test]
    fn from_config_loads_map_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("app.map.json"),
            r#"{"sourceFile":"app.src","generatedFile":"app.go","mappings":[]}"#,
        )
        .unwrap();
        let mut config = TetherConfig::default();
        config.maps.dir = Some(dir.path().to_path_buf());

        let ctx = AdapterContext::from_config(&config).unwrap();
        assert_eq!(ctx.maps().len(), 1);
        assert!(ctx.catalog().is_empty());
        assert_eq!(ctx.next_session_id(), 1);
        assert_eq!(ctx.clone().next_session_id(), 2);
    }
}
