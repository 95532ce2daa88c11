// kiln-core/src/pipeline/engine.rs
// Drives resolve -> select -> install -> test for a batch of targets.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use kiln_common::dependency::{DependencyResolver, HostProbe, ResolvedGraph};
use kiln_common::error::{KilnError, Result};
use kiln_common::formulary::Formulary;
use kiln_common::model::{InstallSource, Manifest, PlatformKey};
use kiln_common::pipeline::{PipelineEvent, PipelineReport, TargetOutcome, TargetStatus};
use threadpool::ThreadPool;
use tracing::{debug, error, instrument, warn};

use super::worker::{self, JobResult, WorkerJob};
use crate::install::InstallContext;
use crate::select::select_with_preference;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Build requested targets from source even when an artifact matches.
    pub build_from_source: bool,
    /// Install build-only dependencies even when nothing is built from source.
    pub include_build_deps: bool,
    /// Run the test procedure of every requested target after installing it.
    pub run_tests: bool,
    pub jobs: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            build_from_source: false,
            include_build_deps: false,
            run_tests: false,
            jobs: 1,
        }
    }
}

/// One target of a plan, with its install source already decided.
#[derive(Debug, Clone)]
pub struct PlannedTarget {
    pub manifest: Arc<Manifest>,
    pub source: InstallSource,
    pub requested: bool,
    /// Direct dependencies that are part of the plan.
    pub dependencies: Vec<String>,
    /// Transitive dependencies in install order.
    pub closure: Vec<String>,
    pub provided_externally: Vec<String>,
}

impl PlannedTarget {
    pub fn name(&self) -> &str {
        &self.manifest.name
    }
}

#[derive(Debug, Clone, Default)]
pub struct InstallPlan {
    pub targets: Vec<PlannedTarget>,
    /// Build-only dependencies dropped because nothing that needs them builds.
    pub pruned: Vec<String>,
    pub provided_externally: Vec<String>,
}

impl InstallPlan {
    pub fn names(&self) -> Vec<&str> {
        self.targets.iter().map(PlannedTarget::name).collect()
    }
}

pub struct Pipeline<'a> {
    ctx: &'a InstallContext,
    formulary: &'a Formulary,
    probe: &'a dyn HostProbe,
    host: PlatformKey,
    options: PipelineOptions,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        ctx: &'a InstallContext,
        formulary: &'a Formulary,
        probe: &'a dyn HostProbe,
        host: PlatformKey,
        options: PipelineOptions,
    ) -> Self {
        Self {
            ctx,
            formulary,
            probe,
            host,
            options,
        }
    }

    /// Resolves `targets` and selects a source for every target that will be
    /// installed. Nothing is fetched or written; any error here aborts the
    /// whole operation before side effects.
    #[instrument(skip(self), name = "pipeline_plan")]
    pub fn plan(&self, targets: &[String]) -> Result<InstallPlan> {
        let graph = DependencyResolver::new(self.formulary, self.probe).resolve_targets(targets)?;
        self.plan_graph(graph)
    }

    fn plan_graph(&self, graph: ResolvedGraph) -> Result<InstallPlan> {
        let nodes = &graph.install_plan;
        let position: HashMap<&str, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name(), i))
            .collect();
        let mut needed = vec![false; nodes.len()];
        let mut sources: Vec<Option<InstallSource>> = vec![None; nodes.len()];

        // Dependents come after their dependencies, so a reverse walk sees
        // every dependent before deciding whether a dependency is needed.
        for i in (0..nodes.len()).rev() {
            let node = &nodes[i];
            if node.requested || self.options.include_build_deps {
                needed[i] = true;
            }
            if !needed[i] {
                continue;
            }
            let force_source = self.options.build_from_source && node.requested;
            let source = select_with_preference(&node.manifest, &self.host, force_source)?;
            let builds = source == InstallSource::BuiltFromSource;
            for dep in &node.dependencies {
                let build_only = node
                    .manifest
                    .dependencies
                    .iter()
                    .filter(|d| &d.name == dep)
                    .all(|d| !d.is_host_provided() && d.tags.is_build_only());
                if builds || !build_only {
                    if let Some(&p) = position.get(dep.as_str()) {
                        needed[p] = true;
                    }
                }
            }
            sources[i] = Some(source);
        }

        let mut closures: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); nodes.len()];
        let mut plan = InstallPlan {
            provided_externally: graph.provided_externally.clone(),
            ..Default::default()
        };
        for (i, node) in nodes.iter().enumerate() {
            let Some(source) = sources[i].take() else {
                debug!("[{}] Build-only dependency not needed; skipping", node.name());
                plan.pruned.push(node.name().to_string());
                continue;
            };
            let dependencies: Vec<String> = node
                .dependencies
                .iter()
                .filter(|d| position.get(d.as_str()).is_some_and(|&p| needed[p]))
                .cloned()
                .collect();
            let mut closure = BTreeSet::new();
            for dep in &dependencies {
                if let Some(&p) = position.get(dep.as_str()) {
                    closure.insert(p);
                    closure.extend(closures[p].iter().copied());
                }
            }
            closures[i] = closure;
            self.ctx.emit(PipelineEvent::SourceSelected {
                target_id: node.name().to_string(),
                source: source.clone(),
            });
            plan.targets.push(PlannedTarget {
                manifest: Arc::clone(&node.manifest),
                source,
                requested: node.requested,
                dependencies,
                closure: closures[i]
                    .iter()
                    .map(|&p| nodes[p].name().to_string())
                    .collect(),
                provided_externally: node.provided_externally.clone(),
            });
        }
        Ok(plan)
    }

    /// Runs the whole operation and reports every target's outcome. Errors
    /// are reported, never returned.
    #[instrument(skip(self), name = "pipeline_run")]
    pub fn run(&self, targets: &[String]) -> PipelineReport {
        let started = Instant::now();
        self.ctx.emit(PipelineEvent::PipelineStarted {
            targets: targets.to_vec(),
        });

        let plan = match self.plan(targets) {
            Ok(plan) => plan,
            Err(e) => {
                error!("Planning failed: {}", e);
                self.ctx.emit(PipelineEvent::LogError {
                    message: e.to_string(),
                });
                return PipelineReport {
                    aborted_by: Some(e),
                    ..Default::default()
                };
            }
        };
        self.ctx.emit(PipelineEvent::ResolutionFinished {
            install_order: plan.names().iter().map(|s| s.to_string()).collect(),
            provided_externally: plan.provided_externally.clone(),
        });

        let (results, aborted_by) = if self.options.jobs <= 1 || plan.targets.len() <= 1 {
            self.run_sequential(&plan)
        } else {
            self.run_parallel(&plan)
        };

        let report = PipelineReport {
            outcomes: plan
                .targets
                .iter()
                .zip(results)
                .map(|(target, result)| TargetOutcome {
                    name: target.name().to_string(),
                    status: result.status,
                    test: result.test,
                })
                .collect(),
            provided_externally: plan.provided_externally.clone(),
            aborted_by,
        };
        self.ctx.emit(PipelineEvent::PipelineFinished {
            duration_secs: started.elapsed().as_secs_f64(),
            success_count: report.success_count(),
            fail_count: report.fail_count(),
        });
        report
    }

    fn job_for(&self, plan: &InstallPlan, index: usize) -> WorkerJob {
        let target = &plan.targets[index];
        WorkerJob {
            index,
            manifest: Arc::clone(&target.manifest),
            source: target.source.clone(),
            linked_dependencies: target.dependencies.clone(),
            dependency_closure: target.closure.clone(),
            provided_externally: target.provided_externally.clone(),
            run_test: self.options.run_tests && target.requested,
        }
    }

    /// First direct dependency of `index` that did not succeed, if any.
    fn failed_dependency(
        plan: &InstallPlan,
        index: usize,
        results: &[Option<JobResult>],
    ) -> Option<String> {
        plan.targets[index]
            .dependencies
            .iter()
            .find(|dep| {
                plan.targets
                    .iter()
                    .position(|t| t.name() == dep.as_str())
                    .and_then(|p| results[p].as_ref())
                    .is_some_and(|r| !r.status.is_success())
            })
            .cloned()
    }

    fn blocked(&self, plan: &InstallPlan, index: usize, dependency: String) -> JobResult {
        let name = plan.targets[index].name();
        warn!("[{}] Not attempted: dependency '{}' failed", name, dependency);
        self.ctx.emit(PipelineEvent::JobBlocked {
            target_id: name.to_string(),
            dependency: dependency.clone(),
        });
        JobResult {
            index,
            status: TargetStatus::Blocked { dependency },
            test: None,
            abort: None,
        }
    }

    fn skipped(index: usize) -> JobResult {
        JobResult {
            index,
            status: TargetStatus::Skipped,
            test: None,
            abort: None,
        }
    }

    fn run_sequential(&self, plan: &InstallPlan) -> (Vec<JobResult>, Option<KilnError>) {
        let mut results: Vec<Option<JobResult>> = vec![None; plan.targets.len()];
        let mut aborted_by: Option<KilnError> = None;

        for index in 0..plan.targets.len() {
            if aborted_by.is_some() {
                results[index] = Some(Self::skipped(index));
                continue;
            }
            if let Some(dep) = Self::failed_dependency(plan, index, &results) {
                results[index] = Some(self.blocked(plan, index, dep));
                continue;
            }
            let result = worker::execute_job(self.ctx, self.job_for(plan, index));
            if let Some(e) = result.aborting_error() {
                error!("Aborting operation: {}", e);
                aborted_by = Some(e.clone());
            }
            results[index] = Some(result);
        }

        let results = results
            .into_iter()
            .enumerate()
            .map(|(i, r)| r.unwrap_or_else(|| Self::skipped(i)))
            .collect();
        (results, aborted_by)
    }

    /// Dispatches every target whose dependencies have finished to a worker
    /// pool; completions come back over a channel.
    fn run_parallel(&self, plan: &InstallPlan) -> (Vec<JobResult>, Option<KilnError>) {
        let count = plan.targets.len();
        let pool = ThreadPool::new(self.options.jobs.min(count));
        let (result_tx, result_rx) = crossbeam_channel::unbounded::<JobResult>();
        debug!("Worker pool started with {} workers", pool.max_count());

        let dep_positions: Vec<Vec<usize>> = plan
            .targets
            .iter()
            .map(|t| {
                t.dependencies
                    .iter()
                    .filter_map(|d| plan.targets.iter().position(|o| o.name() == d.as_str()))
                    .collect()
            })
            .collect();

        let mut results: Vec<Option<JobResult>> = vec![None; count];
        let mut dispatched = vec![false; count];
        let mut in_flight = 0usize;
        let mut aborted_by: Option<KilnError> = None;

        loop {
            if aborted_by.is_none() {
                for index in 0..count {
                    if dispatched[index] || dep_positions[index].iter().any(|&d| results[d].is_none()) {
                        continue;
                    }
                    dispatched[index] = true;
                    if let Some(dep) = Self::failed_dependency(plan, index, &results) {
                        results[index] = Some(self.blocked(plan, index, dep));
                        continue;
                    }
                    let ctx = self.ctx.clone();
                    let job = self.job_for(plan, index);
                    let tx = result_tx.clone();
                    in_flight += 1;
                    debug!("[{}] Submitting job to worker pool", plan.targets[index].name());
                    pool.execute(move || {
                        let result = worker::execute_job(&ctx, job);
                        let _ = tx.send(result);
                    });
                }
            }
            if in_flight == 0 {
                break;
            }
            let Ok(result) = result_rx.recv() else {
                break;
            };
            in_flight -= 1;
            if aborted_by.is_none() {
                if let Some(e) = result.aborting_error() {
                    error!("Aborting operation: {}", e);
                    aborted_by = Some(e.clone());
                    self.ctx.cancel.cancel();
                }
            }
            let index = result.index;
            results[index] = Some(result);
        }
        pool.join();

        let results = results
            .into_iter()
            .enumerate()
            .map(|(i, r)| r.unwrap_or_else(|| Self::skipped(i)))
            .collect();
        (results, aborted_by)
    }
}
