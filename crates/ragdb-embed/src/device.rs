use candle_core::Device;
use tracing::info;

/// Picks the accelerator compiled in via features, falling back to CPU.
pub fn select_device() -> Device {
    #[cfg(feature = "cuda")]
    {
        if let Ok(dev) = Device::new_cuda(0) {
            info!(device = "cuda", "embedding device selected");
            return dev;
        }
    }
    #[cfg(feature = "metal")]
    {
        if let Ok(dev) = Device::new_metal(0) {
            info!(device = "metal", "embedding device selected");
            return dev;
        }
    }
    info!(device = "cpu", "embedding device selected");
    Device::Cpu
}
