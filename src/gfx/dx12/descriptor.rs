//! DirectX 12 描述符堆
//!
//! 封装 ID3D12DescriptorHeap，按槽位计算 CPU / GPU 句柄。

use windows::Win32::Graphics::Direct3D12::*;

use crate::core::error::{GraphicsError, Result};
use crate::renderer::descriptor::DescriptorHeapKind;

pub struct Dx12DescriptorHeap {
    heap: ID3D12DescriptorHeap,
    kind: DescriptorHeapKind,
    increment_size: u32,
    cpu_start: usize,
    /// 仅着色器可见的堆有 GPU 句柄
    gpu_start: Option<u64>,
    capacity: u32,
}

impl Dx12DescriptorHeap {
    pub fn new(device: &ID3D12Device, kind: DescriptorHeapKind, capacity: u32) -> Result<Self> {
        let heap_type = heap_type(kind);
        let flags = if kind.is_shader_visible() {
            D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE
        } else {
            D3D12_DESCRIPTOR_HEAP_FLAG_NONE
        };

        unsafe {
            let heap: ID3D12DescriptorHeap = device
                .CreateDescriptorHeap(&D3D12_DESCRIPTOR_HEAP_DESC {
                    Type: heap_type,
                    NumDescriptors: capacity.max(1),
                    Flags: flags,
                    NodeMask: 0,
                })
                .map_err(|e| {
                    GraphicsError::ResourceCreation(format!("Failed to create {} descriptor heap: {}", kind.name(), e))
                })?;

            let increment_size = device.GetDescriptorHandleIncrementSize(heap_type);
            let cpu_start = heap.GetCPUDescriptorHandleForHeapStart().ptr;
            let gpu_start = kind
                .is_shader_visible()
                .then(|| heap.GetGPUDescriptorHandleForHeapStart().ptr);

            Ok(Self {
                heap,
                kind,
                increment_size,
                cpu_start,
                gpu_start,
                capacity,
            })
        }
    }

    pub fn heap(&self) -> &ID3D12DescriptorHeap {
        &self.heap
    }

    pub fn kind(&self) -> DescriptorHeapKind {
        self.kind
    }

    pub fn cpu_handle(&self, index: u32) -> Result<D3D12_CPU_DESCRIPTOR_HANDLE> {
        self.check(index)?;
        Ok(D3D12_CPU_DESCRIPTOR_HANDLE {
            ptr: self.cpu_start + (index * self.increment_size) as usize,
        })
    }

    pub fn gpu_handle(&self, index: u32) -> Result<D3D12_GPU_DESCRIPTOR_HANDLE> {
        self.check(index)?;
        let start = self.gpu_start.ok_or_else(|| {
            GraphicsError::Validation(format!("{} descriptor heap is not shader visible", self.kind.name()))
        })?;
        Ok(D3D12_GPU_DESCRIPTOR_HANDLE {
            ptr: start + (index * self.increment_size) as u64,
        })
    }

    fn check(&self, index: u32) -> Result<()> {
        if index >= self.capacity {
            return Err(GraphicsError::Validation(format!(
                "descriptor {} out of range for {} heap of {}",
                index,
                self.kind.name(),
                self.capacity
            ))
            .into());
        }
        Ok(())
    }
}

fn heap_type(kind: DescriptorHeapKind) -> D3D12_DESCRIPTOR_HEAP_TYPE {
    match kind {
        DescriptorHeapKind::CbvSrvUav => D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
        DescriptorHeapKind::Rtv => D3D12_DESCRIPTOR_HEAP_TYPE_RTV,
        DescriptorHeapKind::Dsv => D3D12_DESCRIPTOR_HEAP_TYPE_DSV,
    }
}
