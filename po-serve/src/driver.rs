//! `InferenceDriver`: load the policy, optionally export it, then serve one transport.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use po_core::{Config, ConfigError, TransportMode};
use po_logging::{
    hash_config_bytes, now_ms, try_git_hash, write_manifest_atomic, Journal, RunManifestV1,
    ServeEventV1, RUN_MANIFEST_VERSION,
};
use po_policy::{sample_state, write_export, ExportError, MlpPolicy, PolicyOracle};
use po_proto::PROTOCOL_VERSION;
use po_runtime::EpisodeParams;

use crate::advisor::Advisor;
use crate::channel::{open_pipes, Channel, CompilerProcess};
use crate::duplex::{DuplexLoop, LoopEnd, LoopSummary};
use crate::error::ServeError;
use crate::remote::AdviceService;
use crate::server::AdviceServer;

/// Seed for the export trace sample.
pub const EXPORT_SAMPLE_SEED: u64 = 0;

pub struct InferenceDriver {
    config: Config,
    advisor: Arc<Advisor>,
    journal: Arc<Journal>,
}

impl InferenceDriver {
    /// Load the checkpoint named by `config`. A load failure is fatal.
    pub fn new(config: Config) -> Result<Self, ServeError> {
        config.validate()?;
        let policy = MlpPolicy::load(&config.policy.checkpoint, &config.policy)?;
        eprintln!(
            "[po-serve] loaded policy from {} ({} -> {})",
            config.policy.checkpoint.display(),
            policy.input_len(),
            policy.action_space()
        );
        Self::with_policy(config, Arc::new(policy))
    }

    /// Build around an already constructed policy (stubs, tests).
    ///
    /// The policy must agree with `config.policy` on state and action sizes.
    pub fn with_policy(config: Config, policy: Arc<dyn PolicyOracle>) -> Result<Self, ServeError> {
        config.validate()?;
        if policy.input_len() != config.policy.state_size
            || policy.action_space() != config.policy.action_space_size
        {
            return Err(ConfigError::Invalid(format!(
                "policy shape {} -> {} does not match configured {} -> {}",
                policy.input_len(),
                policy.action_space(),
                config.policy.state_size,
                config.policy.action_space_size
            ))
            .into());
        }
        let journal = Arc::new(Journal::open(
            &config.logging.completion_log,
            config.logging.events_path.as_deref(),
            config.logging.flush_every_lines,
        )?);
        let params = EpisodeParams {
            state_len: config.policy.state_size,
            reward: config.reward,
        };
        let advisor = Arc::new(Advisor::new(policy, params, Some(Arc::clone(&journal))));
        let driver = Self {
            config,
            advisor,
            journal,
        };
        if driver.config.export.enabled {
            driver.export();
        }
        driver.write_manifest();
        Ok(driver)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn advisor(&self) -> &Arc<Advisor> {
        &self.advisor
    }

    /// One-shot portable export. Failure is logged and serving continues.
    pub fn export(&self) -> Option<PathBuf> {
        let path = self.config.export.path.clone();
        match self.try_export(&path) {
            Ok(()) => {
                eprintln!("[po-serve] exported policy graph to {}", path.display());
                self.note(ServeEventV1::new("export_ok", self.mode()).detail(path.display().to_string()));
                Some(path)
            }
            Err(e) => {
                eprintln!("[po-serve] export failed (continuing): {e}");
                self.note(ServeEventV1::new("export_failed", self.mode()).detail(e.to_string()));
                None
            }
        }
    }

    /// Serve the configured transport until it ends or `shutdown` is raised.
    pub fn run(&self, shutdown: Arc<AtomicBool>) -> Result<(), ServeError> {
        let res = match self.config.transport.mode {
            TransportMode::Remote => self.run_remote(shutdown),
            TransportMode::Pipe => match Channel::from_config(&self.config.transport) {
                Channel::Subprocess { program, args } => {
                    self.run_subprocess(&program, &args, &shutdown).map(|_| ())
                }
                Channel::NamedPipes { read, write } => self.run_pipes(&read, &write, &shutdown),
            },
        };
        if let Err(e) = self.journal.flush() {
            eprintln!("[po-serve] event log flush failed: {e}");
        }
        res
    }

    fn run_remote(&self, shutdown: Arc<AtomicBool>) -> Result<(), ServeError> {
        let endpoint = self.config.endpoint()?;
        let server = AdviceServer::bind(&endpoint)?;
        eprintln!("[po-serve] serving advice on {}", server.local_endpoint()?);
        let service = AdviceService::new(Arc::clone(&self.advisor));
        server.serve(service, self.config.transport.encoding, shutdown)
    }

    /// Drive a spawned compiler until it exits.
    pub fn run_subprocess(
        &self,
        program: &str,
        args: &[String],
        shutdown: &AtomicBool,
    ) -> Result<LoopSummary, ServeError> {
        let mut child = CompilerProcess::spawn(program, args)?;
        self.note(ServeEventV1::new("peer_connected", "pipe").detail(format!("{program} (pid {})", child.id())));
        let (reader, writer) = child.take_io()?;
        let mut duplex = DuplexLoop::new(&self.advisor, self.config.transport.encoding, reader, writer);
        let res = duplex.run(shutdown);
        // Closing our end of its stdin lets a well-behaved child exit.
        drop(duplex);
        let status = child.wait()?;
        self.note(ServeEventV1::new("peer_exited", "pipe").detail(status.to_string()));
        let summary = res?;
        self.log_summary(&summary);
        Ok(summary)
    }

    fn run_pipes(&self, read: &Path, write: &Path, shutdown: &AtomicBool) -> Result<(), ServeError> {
        while !shutdown.load(Ordering::Relaxed) {
            eprintln!(
                "[po-serve] waiting for compiler on {} / {}",
                read.display(),
                write.display()
            );
            let (reader, writer) = open_pipes(read, write)?;
            self.note(ServeEventV1::new("peer_connected", "pipe"));
            let mut duplex = DuplexLoop::new(&self.advisor, self.config.transport.encoding, reader, writer);
            match duplex.run(shutdown) {
                Ok(summary) => {
                    self.log_summary(&summary);
                    match summary.end {
                        LoopEnd::Shutdown => return Ok(()),
                        LoopEnd::Desynced => {
                            self.note(ServeEventV1::new("peer_desynced", "pipe"));
                        }
                        LoopEnd::PeerClosed | LoopEnd::Stopped => {}
                    }
                }
                Err(e @ ServeError::PeerDisconnected) => {
                    eprintln!("[po-serve] compiler went away mid-episode; reopening pipes");
                    self.note(ServeEventV1::new("peer_disconnected", "pipe").detail(e.to_string()));
                }
                // Only opening the pipes is fatal; a failed session is dropped.
                Err(e) => {
                    eprintln!("[po-serve] pipe session failed: {e}; reopening pipes");
                    self.note(ServeEventV1::new("session_error", "pipe").detail(e.to_string()));
                }
            }
        }
        Ok(())
    }

    fn try_export(&self, path: &Path) -> Result<(), ExportError> {
        let policy = self.advisor.policy();
        let sample = sample_state(policy.input_len(), EXPORT_SAMPLE_SEED);
        let bytes = policy.export_portable(&sample)?;
        write_export(path, &bytes)
    }

    fn write_manifest(&self) {
        let Some(events) = &self.config.logging.events_path else {
            return;
        };
        let cfg = &self.config;
        let config_hash = serde_yaml::to_string(cfg)
            .ok()
            .map(|s| hash_config_bytes(s.as_bytes()));
        let created = now_ms();
        let m = RunManifestV1 {
            run_manifest_version: RUN_MANIFEST_VERSION,
            run_id: format!("advisor-{created}"),
            created_ts_ms: created,
            protocol_version: PROTOCOL_VERSION,
            advisor_version: crate::VERSION.to_string(),
            target: cfg.target.as_str().to_string(),
            transport_mode: self.mode().to_string(),
            encoding: cfg.transport.encoding.to_string(),
            state_size: cfg.policy.state_size,
            action_space_size: cfg.policy.action_space_size,
            checkpoint: cfg.policy.checkpoint.display().to_string(),
            export_path: cfg
                .export
                .enabled
                .then(|| cfg.export.path.display().to_string()),
            git_hash: try_git_hash(),
            config_hash,
        };
        let path = manifest_path(events);
        if let Err(e) = write_manifest_atomic(&path, &m) {
            eprintln!("[po-serve] run manifest write failed: {e}");
        }
    }

    fn log_summary(&self, s: &LoopSummary) {
        eprintln!(
            "[po-serve] duplex session ended ({:?}): {} completed, {} aborted",
            s.end, s.completed, s.aborted
        );
    }

    fn mode(&self) -> &'static str {
        self.config.transport.mode.as_str()
    }

    fn note(&self, ev: ServeEventV1) {
        if let Err(e) = self.journal.record_event(&ev) {
            eprintln!("[po-serve] event log write failed: {e}");
        }
    }
}

/// `logs/events.ndjson` -> `logs/events.run.json`.
pub fn manifest_path(events: &Path) -> PathBuf {
    events.with_extension("run.json")
}
