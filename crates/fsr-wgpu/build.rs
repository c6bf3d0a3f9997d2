//! Build script for fsr-wgpu crate
//!
//! This build script specializes the FSR filter kernel for each supported storage format,
//! validates and minifies it together with the presentation blit shader, and embeds the
//! results as string constants in `$OUT_DIR/shaders.rs`.

/// Placeholder in `wgsl/fsr.wgsl` replaced by the storage texel format
const STORAGE_FORMAT_PLACEHOLDER: &str = "STORAGE_FORMAT";

/// Minifies WGSL shader source code to reduce binary size
///
/// Uses naga to parse, validate, and regenerate the WGSL code in a more compact form.
/// This reduces the size of embedded shaders without affecting functionality.
fn minify_wgsl(shader: &str) -> Result<String, Box<dyn std::error::Error>> {
    let mut module = naga::front::wgsl::parse_str(shader)?;

    wgsl_minifier::minify_module(&mut module);

    let mut validator = naga::valid::Validator::new(naga::valid::ValidationFlags::all(), naga::valid::Capabilities::all());
    let info = validator.validate(&module)?;
    let output = naga::back::wgsl::write_string(&module, &info, naga::back::wgsl::WriterFlags::empty())?;

    Ok(wgsl_minifier::minify_wgsl_source(&output))
}

/// Converts WGSL shader source into a Rust string literal
///
/// Minifies the shader and escapes it for embedding as a string constant in generated Rust code.
/// A shader naga rejects is embedded verbatim so that the failure surfaces as a kernel load
/// error when the device compiles it, with the driver's diagnostics attached.
fn dump_shader_string_literal(name: &str, shader: &str) -> String {
    let code = match minify_wgsl(shader) {
        Ok(minified) => minified,
        Err(e) => {
            println!("cargo:warning=WGSL shader {name} failed validation, embedding it unminified: {e}");
            shader.to_string()
        }
    };

    // Escape special characters for Rust string literal
    let escaped_shader = code.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n");
    format!("\"{}\"", escaped_shader)
}

/// Generates the shaders.rs file with the embedded kernel variants and the blit shader
fn write_code() {
    let manifest_dir = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let wgsl_dir = manifest_dir.join("wgsl");

    let kernel_template = std::fs::read_to_string(wgsl_dir.join("fsr.wgsl")).expect("Failed to read wgsl/fsr.wgsl");
    let blit = std::fs::read_to_string(wgsl_dir.join("blit.wgsl")).expect("Failed to read wgsl/blit.wgsl");

    let mut code = String::new();

    // File header
    code.push_str("// This file is generated by the build script.\n\n");

    code.push_str(&format!("pub const STORAGE_FORMAT_PLACEHOLDER: &str = \"{STORAGE_FORMAT_PLACEHOLDER}\";\n\n"));

    // Unspecialized kernel, used when a host overrides the storage format at runtime
    code.push_str(&format!(
        "pub const FSR_KERNEL_TEMPLATE: &str = \"{}\";\n\n",
        kernel_template.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
    ));

    for (id, storage_format) in [("FSR_KERNEL_STANDARD", "rgba8unorm"), ("FSR_KERNEL_EXTENDED", "rgba16float")] {
        println!("Specializing filter kernel: {id} ({storage_format})");
        let specialized = kernel_template.replace(STORAGE_FORMAT_PLACEHOLDER, storage_format);
        code.push_str(&format!("pub const {id}: &str = {};\n\n", dump_shader_string_literal(id, &specialized)));
    }

    code.push_str(&format!("pub const BLIT_SHADER: &str = {};\n\n", dump_shader_string_literal("BLIT_SHADER", &blit)));

    code.push_str("// END OF GENERATED CODE\n");

    // Write the generated code to the build output directory
    let out_dir = std::env::var("OUT_DIR").expect("OUT_DIR not set");
    let output_path = std::path::PathBuf::from(out_dir).join("shaders.rs");
    std::fs::write(output_path, code).expect("Failed to write shaders.rs");
}

/// Build script main function
fn main() {
    println!("cargo:rerun-if-changed=wgsl/fsr.wgsl");
    println!("cargo:rerun-if-changed=wgsl/blit.wgsl");

    write_code();
}
