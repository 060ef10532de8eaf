//! Configuração do wadispatch carregada a partir de `wadispatch.toml`.
//!
//! Todos os campos têm default, então um arquivo ausente resulta numa
//! configuração funcional apontando para um provedor local. As variáveis
//! `WADISPATCH_API_URL` e `WADISPATCH_API_KEY` têm precedência sobre o arquivo.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::control::EngineSettings;
use crate::job::Delays;
use crate::poller::PollerSettings;
use crate::runner::RunnerSettings;

pub const DEFAULT_CONFIG_FILE: &str = "wadispatch.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// URL base da API do provedor de WhatsApp.
    pub api_url: String,
    pub api_key: String,

    /// Diretório com o ledger compartilhado de jobs e o log de histórico.
    pub data_dir: PathBuf,

    /// Prefixo dos ids de jobs criados por este processo.
    pub context: String,

    pub start_delay_ms: u64,
    pub step_delay_ms: u64,
    pub pause_poll_ms: u64,
    pub recheck_ms: u64,
    pub poll_interval_ms: u64,
    pub terminal_grace_ms: u64,

    /// Intervalo de varredura do diretório de dados em busca de escritas de outros processos.
    pub watch_interval_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8080".to_string(),
            api_key: String::new(),
            data_dir: PathBuf::from(".wadispatch"),
            context: "cli".to_string(),
            start_delay_ms: 1_000,
            step_delay_ms: 2_000,
            pause_poll_ms: 500,
            recheck_ms: 100,
            poll_interval_ms: 2_000,
            terminal_grace_ms: 3_000,
            watch_interval_ms: 250,
            request_timeout_secs: 60,
        }
    }
}

impl DispatchConfig {
    /// Carrega de `path`, ou de `wadispatch.toml` no diretório atual.
    /// Arquivo padrão ausente usa os defaults; caminho explícito ausente é erro.
    /// Intervalos zerados são rejeitados.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    Self::from_file(path)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let periods = [
            ("pause_poll_ms", self.pause_poll_ms),
            ("recheck_ms", self.recheck_ms),
            ("poll_interval_ms", self.poll_interval_ms),
            ("watch_interval_ms", self.watch_interval_ms),
            ("request_timeout_secs", self.request_timeout_secs),
        ];
        for (name, value) in periods {
            if value == 0 {
                bail!("{name} must be greater than zero");
            }
        }
        Ok(())
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("invalid config in {}", path.display()))
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("WADISPATCH_API_URL").filter(|v| !v.is_empty()) {
            self.api_url = url;
        }
        if let Some(key) = lookup("WADISPATCH_API_KEY").filter(|v| !v.is_empty()) {
            self.api_key = key;
        }
    }

    pub fn ledger_dir(&self) -> PathBuf {
        self.data_dir.join("ledger")
    }

    pub fn history_path(&self) -> PathBuf {
        self.data_dir.join("history.jsonl")
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            runner: RunnerSettings {
                pause_poll: Duration::from_millis(self.pause_poll_ms),
                recheck: Duration::from_millis(self.recheck_ms),
            },
            poller: PollerSettings {
                interval: Duration::from_millis(self.poll_interval_ms),
                grace: Duration::from_millis(self.terminal_grace_ms),
            },
            delays: Delays::new(self.start_delay_ms, self.step_delay_ms),
        }
    }
}
