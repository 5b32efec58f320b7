// Adapter/device provisioning
//
// Picks the GPU the engine runs on and creates the logical device:
// - software adapters only when explicitly requested
// - adapters that fail the trial device probe are skipped
// - among the rest, the largest dedicated memory wins

use crate::gpu::{AdapterInfo, AdapterSource, Backend, GpuError, GpuResult, Instance};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProvisionOptions {
    /// Use the software rasterizer instead of a hardware adapter
    pub use_software_adapter: bool,
    /// Call the debug layer hook before device creation
    pub enable_debug_layer: bool,
}

/// Selects an adapter from `source`. Finding none is an error, never an
/// empty result.
pub fn select_adapter<S: AdapterSource>(
    source: &S,
    use_software: bool,
) -> GpuResult<(AdapterInfo, S::Adapter)> {
    let candidates = source.enumerate_adapters()?;

    if use_software {
        return candidates
            .into_iter()
            .find(|(info, _)| info.is_software)
            .ok_or(GpuError::NoSuitableAdapter);
    }

    let mut best: Option<(AdapterInfo, S::Adapter)> = None;
    for (info, adapter) in candidates {
        if info.is_software {
            log::debug!("Skipping software adapter {}", info.name);
            continue;
        }
        if !source.probe(&adapter) {
            log::debug!("Skipping adapter {}: device probe failed", info.name);
            continue;
        }

        let better = match &best {
            Some((current, _)) => info.dedicated_video_memory > current.dedicated_video_memory,
            None => true,
        };
        if better {
            best = Some((info, adapter));
        }
    }

    best.ok_or(GpuError::NoSuitableAdapter)
}

/// Enables the debug layer if asked, selects an adapter and creates the device.
pub fn provision<B, I>(mut instance: I, options: &ProvisionOptions) -> GpuResult<B::Device>
where
    B: Backend,
    I: Instance<B>,
{
    if options.enable_debug_layer {
        instance.enable_debug_layer()?;
    }

    let (info, adapter) = select_adapter(&instance, options.use_software_adapter)?;
    log::info!(
        "Selected adapter: {} ({} MiB dedicated{})",
        info.name,
        info.dedicated_video_memory / (1024 * 1024),
        if info.is_software { ", software" } else { "" }
    );

    instance.create_device(adapter)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeSource {
        adapters: Vec<(AdapterInfo, bool)>,
    }

    impl AdapterSource for FakeSource {
        type Adapter = usize;

        fn enumerate_adapters(&self) -> GpuResult<Vec<(AdapterInfo, usize)>> {
            Ok(self.adapters.iter().enumerate().map(|(i, (info, _))| (info.clone(), i)).collect())
        }

        fn probe(&self, adapter: &usize) -> bool {
            self.adapters[*adapter].1
        }
    }

    fn adapter(name: &str, memory_mib: u64, software: bool) -> AdapterInfo {
        AdapterInfo {
            name: name.to_string(),
            dedicated_video_memory: memory_mib * 1024 * 1024,
            is_software: software,
        }
    }

    #[test]
    fn prefers_largest_dedicated_memory() {
        let source = FakeSource {
            adapters: vec![
                (adapter("integrated", 128, false), true),
                (adapter("discrete", 8192, false), true),
                (adapter("older", 2048, false), true),
            ],
        };
        let (info, index) = select_adapter(&source, false).unwrap();
        assert_eq!(info.name, "discrete");
        assert_eq!(index, 1);
    }

    #[test]
    fn skips_software_and_failed_probes() {
        let source = FakeSource {
            adapters: vec![
                (adapter("warp", 0, true), true),
                (adapter("broken", 16384, false), false),
                (adapter("working", 512, false), true),
            ],
        };
        let (info, _) = select_adapter(&source, false).unwrap();
        assert_eq!(info.name, "working");
    }

    #[test]
    fn ties_keep_first_enumerated() {
        let source = FakeSource {
            adapters: vec![
                (adapter("first", 0, false), true),
                (adapter("second", 0, false), true),
            ],
        };
        assert_eq!(select_adapter(&source, false).unwrap().0.name, "first");
    }

    #[test]
    fn software_request_picks_software_adapter() {
        let source = FakeSource {
            adapters: vec![
                (adapter("discrete", 8192, false), true),
                (adapter("warp", 0, true), true),
            ],
        };
        assert_eq!(select_adapter(&source, true).unwrap().0.name, "warp");
    }

    #[test]
    fn no_eligible_adapter_is_an_error() {
        let source = FakeSource {
            adapters: vec![
                (adapter("warp", 0, true), true),
                (adapter("broken", 4096, false), false),
            ],
        };
        assert!(matches!(select_adapter(&source, false), Err(GpuError::NoSuitableAdapter)));

        let empty = FakeSource { adapters: Vec::new() };
        assert!(matches!(select_adapter(&empty, true), Err(GpuError::NoSuitableAdapter)));
    }
}
