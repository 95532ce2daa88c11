// kiln-common/src/model/mod.rs
// Declares the modules within the model directory.

pub mod artifact;
pub mod manifest;
pub mod platform;
pub mod procedure;
pub mod record;

// Re-export
pub use artifact::{Artifact, RelocationPolicy};
pub use manifest::{check_path_component, License, Manifest, Resource, SourceLocator};
pub use platform::{Arch, OsFamily, PlatformKey};
pub use procedure::{
    Arg, Command, EnvMode, EnvOverride, InstallProcedure, Placeholder, StdArgs, Step,
    TestProcedure, Tool,
};
pub use record::{InstallSource, InstallationRecord};
