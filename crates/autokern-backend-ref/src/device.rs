use autokern::backend::Device;

const DEFAULT_EXTENSIONS: &str = "cl_khr_fp64 cl_khr_global_int32_base_atomics cl_khr_local_int32_base_atomics";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefDevice {
    name: String,
    ordinal: usize,
    extensions: String,
}

impl RefDevice {
    pub fn new() -> Self {
        RefDevice {
            name: "reference".to_string(),
            ordinal: 0,
            extensions: DEFAULT_EXTENSIONS.to_string(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_ordinal(mut self, ordinal: usize) -> Self {
        self.ordinal = ordinal;
        self
    }

    /// Replaces the space separated extension list.
    pub fn with_extensions(mut self, extensions: impl Into<String>) -> Self {
        self.extensions = extensions.into();
        self
    }
}

impl Default for RefDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for RefDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn ordinal(&self) -> usize {
        self.ordinal
    }

    fn extensions(&self) -> &str {
        &self.extensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_fp64_unless_overridden() {
        assert!(RefDevice::new().has_extension("cl_khr_fp64"));
        let device = RefDevice::new().with_extensions("cl_khr_icd").with_ordinal(2);
        assert!(!device.has_extension("cl_khr_fp64"));
        assert!(!device.has_extension("cl_khr"));
        assert_eq!(device.ordinal(), 2);
    }
}
