// kiln-common/src/dependency/host.rs
use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

/// Answers whether the host already provides a named capability
/// (an executable, a library, a language runtime).
pub trait HostProbe: Send + Sync {
    fn has_capability(&self, name: &str) -> bool;
}

/// Memoises another probe's answers for the lifetime of the process.
pub struct CachedHostProbe<P> {
    inner: P,
    cache: Mutex<HashMap<String, bool>>,
}

impl<P: HostProbe> CachedHostProbe<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }
}

impl<P: HostProbe> HostProbe for CachedHostProbe<P> {
    fn has_capability(&self, name: &str) -> bool {
        if let Ok(cache) = self.cache.lock() {
            if let Some(answer) = cache.get(name) {
                return *answer;
            }
        }
        let answer = self.inner.has_capability(name);
        debug!("Host capability '{}': {}", name, answer);
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(name.to_string(), answer);
        }
        answer
    }
}

/// A probe with a fixed answer set, for hosts described up front.
#[derive(Debug, Clone, Default)]
pub struct StaticHostProbe {
    capabilities: Vec<String>,
}

impl StaticHostProbe {
    pub fn new<I, S>(capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            capabilities: capabilities.into_iter().map(Into::into).collect(),
        }
    }

    pub fn none() -> Self {
        Self::default()
    }
}

impl HostProbe for StaticHostProbe {
    fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c == name)
    }
}

impl<T: HostProbe + ?Sized> HostProbe for &T {
    fn has_capability(&self, name: &str) -> bool {
        (**self).has_capability(name)
    }
}

impl<T: HostProbe + ?Sized> HostProbe for std::sync::Arc<T> {
    fn has_capability(&self, name: &str) -> bool {
        (**self).has_capability(name)
    }
}
