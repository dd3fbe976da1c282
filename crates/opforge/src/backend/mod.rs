pub mod host;
#[cfg(feature = "wgpu")]
pub mod wgpu;
