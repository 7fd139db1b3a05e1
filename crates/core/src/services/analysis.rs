use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::analysis::{
    CallGraph, CallGraphBuilder, CodeUnit, FunctionRecoverer, FunctionSummary,
};
use crate::backends::{default_decoder_registry, DecodeError, DecoderRegistry};
use crate::config::{AnalysisConfig, ConfigError};
use crate::extract::{
    stage_tree, ContainerExtractor, EntryKind, ExtractedEntry, ExtractionTree, StagingError,
};
use crate::image::{is_object, LoadedImage};
use crate::model::{
    Architecture, Artifact, CancelReason, CancellationToken, FunctionId, Stage, Warning,
    WarningKind,
};
use crate::signatures::{SignatureError, SignatureScanner, SignatureSet};
use crate::vuln::{CompiledRules, Finding, RuleError, RuleSet, VulnerabilityScanner};

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Invalid input: {0}")]
    Input(String),
    #[error("I/O failure: {0}")]
    Io(#[from] StagingError),
    #[error(transparent)]
    Signatures(#[from] SignatureError),
    #[error(transparent)]
    Rules(#[from] RuleError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Decoder(#[from] DecodeError),
}

/// Which pipeline a run took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisPath {
    /// The artifact itself is the code image.
    Binary,
    /// The artifact is unpacked first; code entries are disassembled.
    Firmware,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    PartialFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactInfo {
    pub id: String,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub duration_ms: u64,
}

/// Everything a completed run reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub artifact: ArtifactInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<Architecture>,
    pub path: AnalysisPath,
    pub entries: Vec<ExtractedEntry>,
    pub functions: Vec<FunctionSummary>,
    pub call_graph: CallGraph,
    pub findings: Vec<Finding>,
    pub warnings: Vec<Warning>,
    pub started_at: String,
    pub duration_ms: u64,
    pub state: Stage,
    pub outcome: Outcome,
    pub stages: Vec<StageRecord>,
}

/// Report plus the in-memory products a frontend may want to render.
#[derive(Debug, Clone)]
pub struct AnalysisOutput {
    pub report: AnalysisReport,
    pub tree: ExtractionTree,
    pub units: Vec<CodeUnit>,
}

pub type StageObserver = Box<dyn Fn(Stage) + Send + Sync>;

/// Stage bookkeeping for one run.
struct RunState<'a> {
    observer: Option<&'a StageObserver>,
    current: Stage,
    entered: Instant,
    stages: Vec<StageRecord>,
    warnings: Vec<Warning>,
    interrupted: Option<(Stage, CancelReason)>,
}

impl<'a> RunState<'a> {
    fn new(observer: Option<&'a StageObserver>) -> Self {
        Self {
            observer,
            current: Stage::Idle,
            entered: Instant::now(),
            stages: Vec::new(),
            warnings: Vec::new(),
            interrupted: None,
        }
    }

    fn enter(&mut self, stage: Stage) {
        if self.current != Stage::Idle {
            self.stages.push(StageRecord {
                stage: self.current,
                duration_ms: self.entered.elapsed().as_millis() as u64,
            });
        }
        info!(from = self.current.as_str(), to = stage.as_str(), "stage transition");
        self.current = stage;
        self.entered = Instant::now();
        if let Some(observer) = self.observer {
            observer(stage);
        }
    }

    /// Record whether cancellation was observed once `stage` finished.
    fn checkpoint(&mut self, cancel: &CancellationToken) -> bool {
        if self.interrupted.is_none() {
            if let Some(reason) = cancel.reason() {
                self.interrupted = Some((self.current, reason));
            }
        }
        self.interrupted.is_some()
    }

    fn extend_warnings(&mut self, warnings: impl IntoIterator<Item = Warning>) {
        for w in warnings {
            warn!(
                stage = w.stage.as_str(),
                kind = ?w.kind,
                location = ?w.location,
                "{}",
                w.message
            );
            self.warnings.push(w);
        }
    }

    fn warn(&mut self, warning: Warning) {
        self.extend_warnings([warning]);
    }
}

/// Drives one artifact through scanning, extraction, disassembly, graph
/// building and rule evaluation.
pub struct AnalysisOrchestrator {
    config: AnalysisConfig,
    scanner: Arc<SignatureScanner>,
    rules: CompiledRules,
    decoders: DecoderRegistry,
    pool: rayon::ThreadPool,
    observer: Option<StageObserver>,
    vuln_scan: bool,
}

impl std::fmt::Debug for AnalysisOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisOrchestrator")
            .field("config", &self.config)
            .field("decoders", &self.decoders)
            .finish_non_exhaustive()
    }
}

impl AnalysisOrchestrator {
    /// Build an orchestrator with the decoders compiled into this build.
    pub fn new(config: AnalysisConfig) -> Result<Self, AnalysisError> {
        Self::with_registry(config, default_decoder_registry())
    }

    /// Build an orchestrator with a caller-supplied decoder registry.
    ///
    /// Signature and rule files are loaded and validated here, so malformed
    /// rules fail before any artifact is touched.
    pub fn with_registry(
        config: AnalysisConfig,
        decoders: DecoderRegistry,
    ) -> Result<Self, AnalysisError> {
        config.validate()?;
        let signatures = match &config.signatures {
            Some(path) => SignatureSet::load(path)?,
            None => SignatureSet::builtin(),
        };
        let rules = match &config.rules {
            Some(path) => RuleSet::load(path)?,
            None => RuleSet::builtin(),
        };
        if !decoders.contains(&config.decoder) {
            return Err(DecodeError::UnknownDecoder(format!(
                "{} (available: {})",
                config.decoder,
                decoders.names().join(", ")
            ))
            .into());
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("cannot build worker pool: {e}")))?;
        Ok(Self {
            scanner: Arc::new(SignatureScanner::new(&signatures)?),
            rules: rules.compile()?,
            decoders,
            pool,
            config,
            observer: None,
            vuln_scan: true,
        })
    }

    /// Register a callback invoked on every stage transition.
    pub fn on_stage(mut self, observer: impl Fn(Stage) + Send + Sync + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Stop after graph building. Reports carry no findings.
    pub fn without_vuln_scan(mut self) -> Self {
        self.vuln_scan = false;
        self
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn scanner(&self) -> &SignatureScanner {
        &self.scanner
    }

    pub fn analyze_path(
        &self,
        path: impl AsRef<Path>,
        cancel: &CancellationToken,
    ) -> Result<AnalysisOutput, AnalysisError> {
        let path = path.as_ref();
        let artifact = Artifact::from_path(path).map_err(|e| {
            self.notify_failed();
            AnalysisError::Input(format!("Failed to read {}: {e}", path.display()))
        })?;
        self.analyze(&artifact, cancel)
    }

    pub fn analyze(
        &self,
        artifact: &Artifact,
        cancel: &CancellationToken,
    ) -> Result<AnalysisOutput, AnalysisError> {
        let cancel = match self.config.time_budget() {
            Some(budget) => cancel.with_deadline(Instant::now() + budget),
            None => cancel.clone(),
        };
        self.pool.install(|| self.run(artifact, &cancel))
    }

    fn notify_failed(&self) {
        if let Some(observer) = &self.observer {
            observer(Stage::Failed);
        }
    }

    fn fail(&self, state: &mut RunState<'_>, err: AnalysisError) -> AnalysisError {
        error!(stage = state.current.as_str(), "analysis failed: {err}");
        state.enter(Stage::Failed);
        err
    }

    fn run(
        &self,
        artifact: &Artifact,
        cancel: &CancellationToken,
    ) -> Result<AnalysisOutput, AnalysisError> {
        let started_at = Utc::now().to_rfc3339();
        let clock = Instant::now();
        let mut state = RunState::new(self.observer.as_ref());

        if artifact.is_empty() {
            let err = AnalysisError::Input(format!("artifact {} is empty", artifact.id()));
            return Err(self.fail(&mut state, err));
        }

        state.enter(Stage::Scanning);
        let hits = self.scanner.scan(artifact.bytes());
        debug!(hits = hits.len(), "signature scan finished");
        let binary = is_object(artifact.bytes()) || (self.config.arch.is_some() && hits.is_empty());
        let path = if binary { AnalysisPath::Binary } else { AnalysisPath::Firmware };
        let mut stopped = state.checkpoint(cancel);

        let mut tree = ExtractionTree::root_only(artifact);
        if path == AnalysisPath::Firmware && !stopped {
            state.enter(Stage::Extracting);
            let extractor = ContainerExtractor::new(
                Arc::clone(&self.scanner),
                self.config.max_depth,
                self.config.max_entry_size,
            );
            let extraction = extractor.extract(artifact, &hits, cancel);
            tree = extraction.tree;
            state.extend_warnings(extraction.warnings);
            if let Some(dir) = &self.config.staging_dir {
                if let Err(e) = stage_tree(&tree, dir) {
                    return Err(self.fail(&mut state, e.into()));
                }
            }
            stopped = state.checkpoint(cancel);
        }

        let mut units = Vec::new();
        if !stopped {
            state.enter(Stage::Disassembling);
            let (loaded, load_warnings) = self.load_images(artifact, &tree, path);
            state.extend_warnings(load_warnings);
            let (recovered, warnings) = self.recover_all(loaded, cancel);
            units = recovered;
            state.extend_warnings(warnings);
            stopped = state.checkpoint(cancel);
        }

        // Graph building is linear in the recovered instructions and always
        // runs for whatever was recovered.
        state.enter(Stage::GraphBuilding);
        let graph = CallGraphBuilder::new().build(&units);
        stopped = state.checkpoint(cancel) || stopped;

        let mut findings = Vec::new();
        if !stopped && self.vuln_scan {
            state.enter(Stage::VulnScanning);
            let scanner = VulnerabilityScanner::new(self.rules.clone());
            findings = scanner.scan(&graph, tree.entries(), cancel);
            state.checkpoint(cancel);
        }

        if let Some((stage, reason)) = state.interrupted {
            let why = match reason {
                CancelReason::Requested => "cancellation requested",
                CancelReason::TimeBudget => "time budget exhausted",
            };
            state.warn(Warning::new(
                stage,
                WarningKind::Cancelled,
                format!("{why} during {}; later stages skipped", stage.as_str()),
            ));
        }
        state.enter(Stage::Done);

        let outcome =
            if state.warnings.is_empty() { Outcome::Success } else { Outcome::PartialFailure };
        let architecture = units.first().map(|u| u.image.arch).or(self.config.arch);
        let functions =
            units.iter().flat_map(|u| u.functions.iter().map(|f| f.summary())).collect();
        let report = AnalysisReport {
            artifact: ArtifactInfo {
                id: artifact.id().to_string(),
                size: artifact.len() as u64,
                sha256: artifact.sha256(),
            },
            architecture,
            path,
            entries: tree.entries().to_vec(),
            functions,
            call_graph: graph,
            findings,
            warnings: state.warnings,
            started_at,
            duration_ms: clock.elapsed().as_millis() as u64,
            state: Stage::Done,
            outcome,
            stages: state.stages,
        };
        info!(
            outcome = ?report.outcome,
            functions = report.functions.len(),
            findings = report.findings.len(),
            "analysis finished"
        );
        Ok(AnalysisOutput { report, tree, units })
    }

    /// Code images to disassemble, keyed by owner path.
    fn load_images(
        &self,
        artifact: &Artifact,
        tree: &ExtractionTree,
        path: AnalysisPath,
    ) -> (Vec<(String, LoadedImage)>, Vec<Warning>) {
        let hint = self.config.arch;
        let mut images = Vec::new();
        let mut warnings = Vec::new();
        let mut push = |owner: &str, loaded: Result<LoadedImage, crate::image::ImageError>| {
            match loaded {
                Ok(image) => images.push((owner.to_string(), image)),
                Err(e) => {
                    let warning =
                        Warning::new(Stage::Disassembling, WarningKind::Format, e.to_string());
                    warnings.push(warning.at(owner));
                }
            }
        };
        match path {
            AnalysisPath::Binary => {
                push(
                    artifact.id(),
                    LoadedImage::load(artifact.shared(), hint, self.config.base_address),
                );
            }
            AnalysisPath::Firmware => {
                for entry in tree.code_entries() {
                    let bytes: Arc<[u8]> = Arc::from(entry.data());
                    let loaded = match entry.load {
                        Some(load) if entry.kind != EntryKind::Executable => Ok(LoadedImage::raw(
                            bytes,
                            hint.unwrap_or(load.arch),
                            load.base,
                            load.entry,
                        )),
                        _ => LoadedImage::from_object(bytes, hint),
                    };
                    push(&entry.path, loaded);
                }
            }
        }
        (images, warnings)
    }

    /// Recover functions per image in parallel, then number them in order.
    fn recover_all(
        &self,
        images: Vec<(String, LoadedImage)>,
        cancel: &CancellationToken,
    ) -> (Vec<CodeUnit>, Vec<Warning>) {
        let results: Vec<(CodeUnit, Vec<Warning>)> = images
            .into_par_iter()
            .filter_map(|(owner, image)| {
                if cancel.is_cancelled() {
                    return None;
                }
                let decoder = match self.decoders.create(&self.config.decoder, image.arch) {
                    Ok(decoder) => decoder,
                    Err(e) => {
                        let warning =
                            Warning::new(Stage::Disassembling, WarningKind::Decode, e.to_string())
                                .at(&owner);
                        let unit = CodeUnit { owner, image, functions: Vec::new() };
                        return Some((unit, vec![warning]));
                    }
                };
                let recoverer = FunctionRecoverer::new(decoder, &self.config);
                let recovery = recoverer.recover(&image, &owner, 0, cancel);
                Some((CodeUnit { owner, image, functions: recovery.functions }, recovery.warnings))
            })
            .collect();

        let mut units = Vec::with_capacity(results.len());
        let mut warnings = Vec::new();
        let mut next_id = 0u32;
        for (mut unit, unit_warnings) in results {
            for function in &mut unit.functions {
                function.id = FunctionId(function.id.0 + next_id);
            }
            next_id += unit.functions.len() as u32;
            warnings.extend(unit_warnings);
            units.push(unit);
        }
        (units, warnings)
    }
}
