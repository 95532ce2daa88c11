// kiln-common/src/dependency/resolver.rs

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error};

use crate::dependency::host::HostProbe;
use crate::dependency::DependencyTag;
use crate::error::{KilnError, Result};
use crate::formulary::Formulary;
use crate::model::Manifest;

/// One manifest in the install order.
#[derive(Debug, Clone)]
pub struct ResolvedNode {
    pub manifest: Arc<Manifest>,
    /// Union of the tags of every edge that reached this node. Requested
    /// targets carry RUNTIME.
    pub accumulated_tags: DependencyTag,
    pub requested: bool,
    /// Direct dependencies that are part of the install graph, declared order.
    pub dependencies: Vec<String>,
    /// Direct host-provided dependencies the host already satisfies.
    pub provided_externally: Vec<String>,
}

impl ResolvedNode {
    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    /// Reached only through build-only edges.
    pub fn is_build_only(&self) -> bool {
        !self.requested && self.accumulated_tags.is_build_only()
    }
}

/// Install order with every dependency before its dependents.
#[derive(Debug, Clone, Default)]
pub struct ResolvedGraph {
    pub install_plan: Vec<ResolvedNode>,
    /// Every host-provided dependency skipped because the host satisfies it.
    pub provided_externally: Vec<String>,
}

impl ResolvedGraph {
    pub fn names(&self) -> Vec<&str> {
        self.install_plan.iter().map(ResolvedNode::name).collect()
    }

    pub fn node(&self, name: &str) -> Option<&ResolvedNode> {
        self.install_plan.iter().find(|n| n.name() == name)
    }

    /// Nodes in the plan that list `name` as a direct dependency.
    pub fn dependents_of<'g>(&'g self, name: &'g str) -> impl Iterator<Item = &'g ResolvedNode> {
        self.install_plan
            .iter()
            .filter(move |n| n.dependencies.iter().any(|d| d == name))
    }
}

pub struct DependencyResolver<'a> {
    formulary: &'a Formulary,
    probe: &'a dyn HostProbe,
    visiting: Vec<String>,
    positions: HashMap<String, usize>,
    install_plan: Vec<ResolvedNode>,
    provided_externally: Vec<String>,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(formulary: &'a Formulary, probe: &'a dyn HostProbe) -> Self {
        Self {
            formulary,
            probe,
            visiting: Vec::new(),
            positions: HashMap::new(),
            install_plan: Vec::new(),
            provided_externally: Vec::new(),
        }
    }

    /// Resolves several requested targets into one merged order. A cycle or a
    /// missing manifest anywhere fails the whole batch.
    pub fn resolve_targets(mut self, targets: &[String]) -> Result<ResolvedGraph> {
        debug!("Starting dependency resolution for targets: {:?}", targets);
        for target in targets {
            self.visit(target, DependencyTag::RUNTIME, true, None)?;
        }
        debug!(
            "Resolved install order: {:?} (provided by host: {:?})",
            self.install_plan.iter().map(|n| n.name()).collect::<Vec<_>>(),
            self.provided_externally
        );
        Ok(ResolvedGraph {
            install_plan: self.install_plan,
            provided_externally: self.provided_externally,
        })
    }

    fn visit(
        &mut self,
        name: &str,
        edge_tags: DependencyTag,
        requested: bool,
        parent: Option<&str>,
    ) -> Result<()> {
        if let Some(start) = self.visiting.iter().position(|n| n == name) {
            let mut path: Vec<String> = self.visiting[start..].to_vec();
            path.push(name.to_string());
            error!("Dependency cycle detected: {}", path.join(" -> "));
            return Err(KilnError::DependencyCycle { path });
        }

        if let Some(&pos) = self.positions.get(name) {
            let node = &mut self.install_plan[pos];
            node.accumulated_tags |= edge_tags;
            node.requested |= requested;
            return Ok(());
        }

        let manifest = self.formulary.get(name).ok_or_else(|| match parent {
            Some(parent) => KilnError::NotFound(format!(
                "No manifest named '{name}' (required by '{parent}')"
            )),
            None => KilnError::NotFound(format!("No manifest named '{name}'")),
        })?;

        self.visiting.push(name.to_string());
        let mut dependencies = Vec::new();
        let mut provided = Vec::new();

        for dep in &manifest.dependencies {
            let mut tags = dep.tags;
            if dep.is_host_provided() {
                if self.probe.has_capability(&dep.name) {
                    debug!("[{}] '{}' is provided by the host", name, dep.name);
                    provided.push(dep.name.clone());
                    if !self.provided_externally.contains(&dep.name) {
                        self.provided_externally.push(dep.name.clone());
                    }
                    continue;
                }
                debug!(
                    "[{}] host lacks '{}', resolving it as a runtime dependency",
                    name, dep.name
                );
                tags.remove(DependencyTag::HOST_PROVIDED);
                tags |= DependencyTag::RUNTIME;
            }
            if !tags.intersects(DependencyTag::GRAPH) {
                continue;
            }
            self.visit(&dep.name, tags, false, Some(name))?;
            if !dependencies.contains(&dep.name) {
                dependencies.push(dep.name.clone());
            }
        }

        self.visiting.pop();
        self.positions
            .insert(name.to_string(), self.install_plan.len());
        self.install_plan.push(ResolvedNode {
            manifest,
            accumulated_tags: edge_tags,
            requested,
            dependencies,
            provided_externally: provided,
        });
        Ok(())
    }
}

/// Resolves a single target against `formulary`.
pub fn resolve(target: &str, formulary: &Formulary, probe: &dyn HostProbe) -> Result<ResolvedGraph> {
    DependencyResolver::new(formulary, probe).resolve_targets(&[target.to_string()])
}
