pub mod definition;
pub mod host;
pub mod resolver;

pub use definition::{Dependency, DependencyTag};
pub use host::{CachedHostProbe, HostProbe, StaticHostProbe};
pub use resolver::{resolve, DependencyResolver, ResolvedGraph, ResolvedNode};
