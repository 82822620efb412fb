use candle_core::{utils, Device};

/// CUDA when available, then Metal, then CPU.
pub fn select_device(cpu: bool) -> candle_core::Result<Device> {
    if cpu {
        return Ok(Device::Cpu);
    }

    if utils::cuda_is_available() {
        Device::new_cuda(0)
    } else if utils::metal_is_available() {
        Device::new_metal(0)
    } else {
        Ok(Device::Cpu)
    }
}

#[test]
fn test_select_cpu() {
    assert!(select_device(true).unwrap().is_cpu());
}
