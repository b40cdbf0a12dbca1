/// Build script for D3D12 Sandbox
///
/// HLSL is compiled at runtime via D3DCompile, so the build only needs to
/// rerun when the shader source changes.
fn main() {
    println!("cargo:rerun-if-changed=assets/shaders/lambert.hlsl");
}
