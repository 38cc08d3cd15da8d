#![deny(clippy::all)]
#![allow(clippy::missing_errors_doc, clippy::must_use_candidate)]

pub mod cancel;
pub mod engine;
pub mod error;
pub mod net;
pub mod paths;
pub mod runtime;
pub mod solver;
pub mod store;

pub use cancel::CancelToken;
pub use engine::{is_installed_in_site_packages, normalize_requirements, solve_key, Installer};
pub use error::InstallError;
pub use runtime::{detect_system_interpreter, is_runtime_healthy, PythonRuntime, RuntimeProvider};
pub use solver::{PipReportSolver, Solver};
pub use store::cas::{compute_sha256, Cas};
pub use store::wheel::extract_wheel;
