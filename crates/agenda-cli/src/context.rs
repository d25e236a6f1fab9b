use agenda_core::{EngineConfig, EngineError, EngineResult};
use agenda_engine::{ActivityBreakpoints, ProcessDefinition, ProcessEngine};
use agenda_persistence::Store;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One CLI invocation's engine, backed by the data file.
pub struct CliContext {
    pub engine: ProcessEngine,
    file: PathBuf,
}

impl CliContext {
    pub fn load(file: &Path, config: Option<&Path>, breakpoints: &[String]) -> EngineResult<Self> {
        let mut config = match config {
            Some(path) => EngineConfig::load_from(path)?,
            None => EngineConfig::load(),
        };
        // Every invocation is its own process: there is no one to send messages to
        config.async_executor.message_queue_mode = false;

        let store = Store::json_file(file)?;
        tracing::debug!("Opened {} at revision {}", file.display(), store.revision());
        let mut builder = ProcessEngine::builder()
            .with_config(config)
            .with_store(store);
        if !breakpoints.is_empty() {
            let debugger = ActivityBreakpoints::new(breakpoints.iter().cloned());
            builder = builder.with_debugger(Arc::new(debugger));
        }
        let engine = builder.build();
        Ok(Self {
            engine,
            file: file.to_path_buf(),
        })
    }

    pub fn file(&self) -> &Path {
        &self.file
    }
}

/// Read a definition from JSON, or TOML when the extension says so
pub fn read_definition(path: &Path) -> EngineResult<ProcessDefinition> {
    let content = std::fs::read_to_string(path)?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| ext.eq_ignore_ascii_case("toml"));
    if is_toml {
        toml::from_str(&content).map_err(|e| {
            EngineError::Validation(format!("Invalid definition {}: {}", path.display(), e))
        })
    } else {
        serde_json::from_str(&content).map_err(|e| {
            EngineError::Validation(format!("Invalid definition {}: {}", path.display(), e))
        })
    }
}

/// `name=value` pairs; values that are not valid JSON are taken as strings
pub fn parse_variables(
    pairs: &[String],
) -> EngineResult<std::collections::BTreeMap<String, serde_json::Value>> {
    pairs
        .iter()
        .map(|pair| {
            let (name, raw) = pair.split_once('=').ok_or_else(|| {
                EngineError::Validation(format!("variable '{}' is not NAME=VALUE", pair))
            })?;
            if name.trim().is_empty() {
                return Err(EngineError::Validation(format!(
                    "variable '{}' has an empty name",
                    pair
                )));
            }
            let value = serde_json::from_str(raw)
                .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
            Ok((name.trim().to_string(), value))
        })
        .collect()
}
