//! Shared fixtures for kiln-core integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use flate2::write::GzEncoder;
use flate2::Compression;
use kiln_common::config::Config;
use kiln_common::dependency::HostProbe;
use kiln_common::error::{KilnError, Result};
use kiln_common::keg::ReceiptStore;
use kiln_common::model::{
    Arch, Arg, Artifact, Manifest, PlatformKey, RelocationPolicy, SourceLocator, Step,
};
use kiln_core::process::{CancelToken, CommandOutput, CommandRunner, CommandSpec};
use kiln_core::{InstallContext, SystemCommandRunner};
use kiln_net::{sha256_hex, Downloader, Fetch, RetryPolicy};
use tempfile::TempDir;

pub const HOST: &str = "x86_64_linux";

pub fn host() -> PlatformKey {
    PlatformKey::linux(Arch::X86_64)
}

/// Serves payloads from memory and counts fetches per URL.
#[derive(Default)]
pub struct MapFetcher {
    payloads: Mutex<HashMap<String, Vec<u8>>>,
    fetches: AtomicUsize,
}

impl MapFetcher {
    pub fn serve(&self, url: &str, bytes: Vec<u8>) {
        self.payloads.lock().unwrap().insert(url.to_string(), bytes);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl Fetch for MapFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.payloads
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| {
                KilnError::DownloadError(
                    String::new(),
                    url.to_string(),
                    "HTTP status 404 Not Found".to_string(),
                )
            })
    }
}

/// Runs commands for real and remembers what it ran.
#[derive(Default)]
pub struct RecordingRunner {
    commands: Mutex<Vec<String>>,
}

impl RecordingRunner {
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.commands.lock().unwrap().len()
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, spec: &CommandSpec, cancel: &CancelToken) -> Result<CommandOutput> {
        self.commands.lock().unwrap().push(spec.display());
        SystemCommandRunner.run(spec, cancel)
    }
}

pub struct NoCapabilities;

impl HostProbe for NoCapabilities {
    fn has_capability(&self, _name: &str) -> bool {
        false
    }
}

/// A throwaway kiln root with an in-memory payload server.
pub struct TestEnv {
    pub root: TempDir,
    pub config: Config,
    pub fetcher: Arc<MapFetcher>,
    pub runner: Arc<RecordingRunner>,
    pub ctx: InstallContext,
}

impl TestEnv {
    pub fn new() -> Self {
        let root = TempDir::new().unwrap();
        let config = Config::with_root(root.path());
        let store = Arc::new(ReceiptStore::open(&config).unwrap());
        let fetcher = Arc::new(MapFetcher::default());
        let downloader = Downloader::new(fetcher.clone(), None).with_retry(RetryPolicy::no_retry());
        let runner = Arc::new(RecordingRunner::default());
        let ctx = InstallContext::new(config.clone(), store, Arc::new(downloader))
            .with_runner(runner.clone());
        Self {
            root,
            config,
            fetcher,
            runner,
            ctx,
        }
    }

    /// Makes `bytes` available at `url` and returns their sha256.
    pub fn serve(&self, url: &str, bytes: Vec<u8>) -> String {
        let sha = sha256_hex(&bytes);
        self.fetcher.serve(url, bytes);
        sha
    }

    /// Manifest built from a source tarball rooted at `<name>-<version>/`.
    pub fn source_manifest(
        &self,
        name: &str,
        version: &str,
        files: &[(&str, &str)],
        steps: Vec<Step>,
    ) -> Manifest {
        let root = format!("{name}-{version}");
        let entries: Vec<(String, &str)> = files
            .iter()
            .map(|(path, contents)| (format!("{root}/{path}"), *contents))
            .collect();
        let url = format!("https://example.test/{root}.tar.gz");
        let sha = self.serve(&url, tar_gz(&entries));
        let mut manifest = Manifest::new(name, version);
        manifest.source = Some(SourceLocator {
            url,
            sha256: sha,
            mirrors: Vec::new(),
        });
        manifest.install.steps = steps;
        manifest
    }

    /// Manifest with a single artifact for the test host, laid out as
    /// `<name>/<version>/...` inside the archive.
    pub fn artifact_manifest(&self, name: &str, version: &str, files: &[(&str, &str)]) -> Manifest {
        let entries: Vec<(String, &str)> = files
            .iter()
            .map(|(path, contents)| (format!("{name}/{version}/{path}"), *contents))
            .collect();
        let url = format!("https://example.test/bottles/{name}-{version}.{HOST}.bottle.tar.gz");
        let sha = self.serve(&url, tar_gz(&entries));
        let mut manifest = Manifest::new(name, version);
        manifest.artifacts.insert(
            host(),
            Artifact {
                url,
                sha256: sha,
                relocation: RelocationPolicy::Relocate,
            },
        );
        manifest
    }

    pub fn tmp_entries(&self) -> usize {
        std::fs::read_dir(self.config.tmp_dir())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

pub fn tar_gz<P: AsRef<str>>(entries: &[(P, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, contents) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, path.as_ref(), contents.as_bytes())
            .unwrap();
    }
    let mut encoder = builder.into_inner().unwrap();
    encoder.flush().unwrap();
    encoder.finish().unwrap()
}

/// `sh -c <script> sh <args...>`; the args are `$1`, `$2`, ... in the script.
pub fn sh(script: &str, args: Vec<Arg>) -> Step {
    let mut all = vec![Arg::from("-c"), Arg::from(script), Arg::from("sh")];
    all.extend(args);
    Step::run("sh", all)
}
