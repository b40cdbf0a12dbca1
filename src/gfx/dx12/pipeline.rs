//! 根签名与管线状态
//!
//! 每个根参数是只含一个描述符的描述符表；像素着色器有一个线性过滤、
//! WRAP 寻址的静态采样器（s0）。HLSL 在运行时用 D3DCompile 编译。

use std::ffi::CString;

use tracing::{debug, info};
use windows::core::PCSTR;
use windows::Win32::Graphics::Direct3D::Fxc::*;
use windows::Win32::Graphics::Direct3D::*;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;

use super::backend::dxgi_format;
use crate::core::error::{GraphicsError, Result};
use crate::renderer::pipeline::{DescriptorRangeKind, PipelineDesc, ShaderVisibility};

/// 编译好的根签名与 PSO
pub struct Dx12Pipeline {
    pub root_signature: ID3D12RootSignature,
    pub state: ID3D12PipelineState,
}

impl Dx12Pipeline {
    pub fn new(device: &ID3D12Device, desc: &PipelineDesc) -> Result<Self> {
        let root_signature = create_root_signature(device, desc)?;

        let source = std::fs::read_to_string(&desc.shader.path).map_err(|e| {
            GraphicsError::ShaderCompilation(format!("Failed to read {}: {}", desc.shader.path.display(), e))
        })?;
        let vs = compile(&source, &desc.shader.vs_entry, "vs_5_0")?;
        let ps = compile(&source, &desc.shader.ps_entry, "ps_5_0")?;
        debug!(shader = %desc.shader.path.display(), "Shaders compiled");

        // 语义名必须以 0 结尾，在 CreateGraphicsPipelineState 返回前保持存活
        let semantics = desc
            .input_layout
            .iter()
            .map(|e| CString::new(e.semantic))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| GraphicsError::ShaderCompilation(format!("Invalid semantic name: {}", e)))?;
        let input_elements: Vec<D3D12_INPUT_ELEMENT_DESC> = desc
            .input_layout
            .iter()
            .zip(&semantics)
            .map(|(element, semantic)| D3D12_INPUT_ELEMENT_DESC {
                SemanticName: PCSTR(semantic.as_ptr() as *const u8),
                SemanticIndex: 0,
                Format: dxgi_format(element.format),
                InputSlot: 0,
                AlignedByteOffset: element.offset,
                InputSlotClass: D3D12_INPUT_CLASSIFICATION_PER_VERTEX_DATA,
                InstanceDataStepRate: 0,
            })
            .collect();

        unsafe {
            let mut pso_desc = D3D12_GRAPHICS_PIPELINE_STATE_DESC {
                pRootSignature: std::mem::transmute_copy(&root_signature),
                VS: bytecode(&vs),
                PS: bytecode(&ps),
                InputLayout: D3D12_INPUT_LAYOUT_DESC {
                    pInputElementDescs: input_elements.as_ptr(),
                    NumElements: input_elements.len() as u32,
                },
                RasterizerState: D3D12_RASTERIZER_DESC {
                    FillMode: D3D12_FILL_MODE_SOLID,
                    CullMode: D3D12_CULL_MODE_BACK,
                    DepthClipEnable: true.into(),
                    ..Default::default()
                },
                DepthStencilState: D3D12_DEPTH_STENCIL_DESC {
                    DepthEnable: true.into(),
                    DepthWriteMask: D3D12_DEPTH_WRITE_MASK_ALL,
                    DepthFunc: D3D12_COMPARISON_FUNC_LESS_EQUAL,
                    StencilEnable: false.into(),
                    StencilReadMask: 0xFF,
                    StencilWriteMask: 0xFF,
                    ..Default::default()
                },
                SampleMask: u32::MAX,
                PrimitiveTopologyType: D3D12_PRIMITIVE_TOPOLOGY_TYPE_TRIANGLE,
                NumRenderTargets: 1,
                DSVFormat: dxgi_format(desc.dsv_format),
                SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
                ..Default::default()
            };
            pso_desc.BlendState.RenderTarget[0].RenderTargetWriteMask = D3D12_COLOR_WRITE_ENABLE_ALL.0 as u8;
            pso_desc.RTVFormats[0] = dxgi_format(desc.rtv_format);

            let state: ID3D12PipelineState = device
                .CreateGraphicsPipelineState(&pso_desc)
                .map_err(|e| GraphicsError::ResourceCreation(format!("Failed to create PSO '{}': {}", desc.name, e)))?;

            info!(pipeline = %desc.name, "Pipeline state created");
            Ok(Self { root_signature, state })
        }
    }
}

fn create_root_signature(device: &ID3D12Device, desc: &PipelineDesc) -> Result<ID3D12RootSignature> {
    // 每个表一个范围，寄存器按类型各自从 0 编号
    let mut cbv_register = 0;
    let mut srv_register = 0;
    let ranges: Vec<D3D12_DESCRIPTOR_RANGE> = desc
        .root_tables
        .iter()
        .map(|table| {
            let (range_type, register) = match table.range {
                DescriptorRangeKind::Cbv => {
                    cbv_register += 1;
                    (D3D12_DESCRIPTOR_RANGE_TYPE_CBV, cbv_register - 1)
                }
                DescriptorRangeKind::Srv => {
                    srv_register += 1;
                    (D3D12_DESCRIPTOR_RANGE_TYPE_SRV, srv_register - 1)
                }
            };
            D3D12_DESCRIPTOR_RANGE {
                RangeType: range_type,
                NumDescriptors: 1,
                BaseShaderRegister: register,
                RegisterSpace: 0,
                OffsetInDescriptorsFromTableStart: D3D12_DESCRIPTOR_RANGE_OFFSET_APPEND,
            }
        })
        .collect();

    let parameters: Vec<D3D12_ROOT_PARAMETER> = desc
        .root_tables
        .iter()
        .zip(&ranges)
        .map(|(table, range)| D3D12_ROOT_PARAMETER {
            ParameterType: D3D12_ROOT_PARAMETER_TYPE_DESCRIPTOR_TABLE,
            Anonymous: D3D12_ROOT_PARAMETER_0 {
                DescriptorTable: D3D12_ROOT_DESCRIPTOR_TABLE {
                    NumDescriptorRanges: 1,
                    pDescriptorRanges: range,
                },
            },
            ShaderVisibility: shader_visibility(table.visibility),
        })
        .collect();

    let sampler = D3D12_STATIC_SAMPLER_DESC {
        Filter: D3D12_FILTER_MIN_MAG_MIP_LINEAR,
        AddressU: D3D12_TEXTURE_ADDRESS_MODE_WRAP,
        AddressV: D3D12_TEXTURE_ADDRESS_MODE_WRAP,
        AddressW: D3D12_TEXTURE_ADDRESS_MODE_WRAP,
        MipLODBias: 0.0,
        MaxAnisotropy: 0,
        ComparisonFunc: D3D12_COMPARISON_FUNC_NEVER,
        BorderColor: D3D12_STATIC_BORDER_COLOR_TRANSPARENT_BLACK,
        MinLOD: 0.0,
        MaxLOD: D3D12_FLOAT32_MAX,
        ShaderRegister: 0,
        RegisterSpace: 0,
        ShaderVisibility: D3D12_SHADER_VISIBILITY_PIXEL,
    };

    let root_desc = D3D12_ROOT_SIGNATURE_DESC {
        NumParameters: parameters.len() as u32,
        pParameters: parameters.as_ptr(),
        NumStaticSamplers: 1,
        pStaticSamplers: &sampler,
        Flags: D3D12_ROOT_SIGNATURE_FLAG_ALLOW_INPUT_ASSEMBLER_INPUT_LAYOUT,
    };

    unsafe {
        let mut signature: Option<ID3DBlob> = None;
        let mut error: Option<ID3DBlob> = None;
        if let Err(e) = D3D12SerializeRootSignature(&root_desc, D3D_ROOT_SIGNATURE_VERSION_1, &mut signature, Some(&mut error)) {
            let message = error.as_ref().map(blob_to_string).unwrap_or_else(|| e.to_string());
            return Err(GraphicsError::ResourceCreation(format!("Failed to serialize root signature: {}", message)).into());
        }
        let signature = signature
            .ok_or_else(|| GraphicsError::ResourceCreation("Root signature serialization produced no blob".to_string()))?;

        device
            .CreateRootSignature(
                0,
                std::slice::from_raw_parts(signature.GetBufferPointer() as *const u8, signature.GetBufferSize()),
            )
            .map_err(|e| GraphicsError::ResourceCreation(format!("Failed to create root signature: {}", e)).into())
    }
}

fn compile(source: &str, entry: &str, target: &str) -> Result<ID3DBlob> {
    let entry_c = CString::new(entry)
        .map_err(|e| GraphicsError::ShaderCompilation(format!("Invalid entry point '{}': {}", entry, e)))?;
    let target_c = CString::new(target)
        .map_err(|e| GraphicsError::ShaderCompilation(format!("Invalid target '{}': {}", target, e)))?;
    let flags = if cfg!(debug_assertions) {
        D3DCOMPILE_DEBUG | D3DCOMPILE_SKIP_OPTIMIZATION
    } else {
        0
    };

    unsafe {
        let mut blob: Option<ID3DBlob> = None;
        let mut error: Option<ID3DBlob> = None;
        let result = D3DCompile(
            source.as_ptr() as *const core::ffi::c_void,
            source.len(),
            None,
            None,
            None,
            PCSTR(entry_c.as_ptr() as *const u8),
            PCSTR(target_c.as_ptr() as *const u8),
            flags,
            0,
            &mut blob,
            Some(&mut error),
        );
        if let Err(e) = result {
            let message = error.as_ref().map(blob_to_string).unwrap_or_else(|| e.to_string());
            return Err(GraphicsError::ShaderCompilation(format!("{} ({}): {}", entry, target, message)).into());
        }
        blob.ok_or_else(|| GraphicsError::ShaderCompilation(format!("{} produced no bytecode", entry)).into())
    }
}

fn bytecode(blob: &ID3DBlob) -> D3D12_SHADER_BYTECODE {
    unsafe {
        D3D12_SHADER_BYTECODE {
            pShaderBytecode: blob.GetBufferPointer(),
            BytecodeLength: blob.GetBufferSize(),
        }
    }
}

fn blob_to_string(blob: &ID3DBlob) -> String {
    unsafe {
        let bytes = std::slice::from_raw_parts(blob.GetBufferPointer() as *const u8, blob.GetBufferSize());
        String::from_utf8_lossy(bytes).trim_end_matches('\0').to_string()
    }
}

fn shader_visibility(visibility: ShaderVisibility) -> D3D12_SHADER_VISIBILITY {
    match visibility {
        ShaderVisibility::All => D3D12_SHADER_VISIBILITY_ALL,
        ShaderVisibility::Vertex => D3D12_SHADER_VISIBILITY_VERTEX,
        ShaderVisibility::Pixel => D3D12_SHADER_VISIBILITY_PIXEL,
    }
}
