//! A container image reference. Opaque beyond its string form -- the runner that resolves it
//! into a running container lives in `hither-container`.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ContainerImage(String);

impl ContainerImage {
    /// Mirrors the Python source's requirement that a container string begin with `docker://`.
    pub fn parse(s: impl Into<String>) -> crate::Result<Self> {
        let s = s.into();
        if !s.starts_with("docker://") && !s.starts_with("singularity://") {
            return Err(crate::HitherError::Other(anyhow::anyhow!(
                "container image {s:?} must begin with docker:// or singularity://"
            )));
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_image_without_scheme() {
        assert!(ContainerImage::parse("ubuntu:latest").is_err());
        assert!(ContainerImage::parse("docker://ubuntu:latest").is_ok());
    }
}
