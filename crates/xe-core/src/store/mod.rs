pub mod cas;
pub mod wheel;

pub use cas::Cas;
pub use wheel::extract_wheel;
