#![deny(clippy::all)]
#![allow(clippy::missing_errors_doc, clippy::must_use_candidate)]

pub mod manifest;
pub mod record;

pub use manifest::{
    load_manifest, load_or_create_manifest, normalize_dep_name, requirement_to_dep_name,
    save_manifest, ManifestError, ProjectManifest, MANIFEST_FILENAME,
};
pub use record::{
    dedupe_packages, normalize_package_identity, package_identity_key, PackageRecord, SolveGraph,
};
