use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigLoad {
    version: u8,

    pub node_id: String,

    /// "tabular" (embedded log-structured store) or "tree" (markdown files).
    pub backend: String,

    pub data_dir: String,

    pub log_level: String,

    #[serde(default)]
    pub vector_dimensions: Option<usize>,
}

impl Default for ConfigLoad {
    fn default() -> Self {
        ConfigLoad {
            version: 1,
            node_id: "local".to_string(),
            backend: "tabular".to_string(),
            data_dir: "./membank-data".to_string(),
            log_level: "info".to_string(),
            vector_dimensions: None,
        }
    }
}

impl ConfigLoad {
    pub fn load(path: &str) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_yaml::from_str(&contents) {
                Ok(config) => config,
                Err(err) => {
                    log::warn!("failed to parse config at {path}, using defaults: {err}");
                    ConfigLoad::default()
                }
            },
            Err(_) => ConfigLoad::default(),
        }
    }
}
