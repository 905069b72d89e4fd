//! Backend kind selection and launch command construction.

use std::net::TcpListener;
use std::path::Path;
use tokio::io::AsyncReadExt;

use crate::config::LaunchRecipe;
use crate::options::LoadOptions;

pub const KIND_LLAMA_CPP: &str = "llama-cpp";
pub const KIND_GGML: &str = "ggml";
pub const KIND_TRANSFORMERS: &str = "transformers";
pub const KIND_ONNX: &str = "onnx";

/// Pick the backend kind for a model: explicit override, then file
/// extension, then magic bytes, then `default_backend`.
pub async fn infer_kind(
    options: &LoadOptions,
    model_path: &Path,
    default_backend: Option<&str>,
) -> Option<String> {
    if let Some(kind) = options.backend.as_deref().filter(|k| !k.trim().is_empty()) {
        return Some(kind.trim().to_string());
    }
    let detected = match kind_from_extension(model_path) {
        Some(kind) => Some(kind),
        None => kind_from_magic(model_path).await,
    };
    detected
        .map(str::to_string)
        .or_else(|| default_backend.map(str::to_string))
}

fn kind_from_extension(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "gguf" => Some(KIND_LLAMA_CPP),
        "bin" | "ggml" => Some(KIND_GGML),
        "safetensors" => Some(KIND_TRANSFORMERS),
        "onnx" => Some(KIND_ONNX),
        _ => None,
    }
}

async fn kind_from_magic(path: &Path) -> Option<&'static str> {
    let mut magic = [0u8; 4];
    let mut file = tokio::fs::File::open(path).await.ok()?;
    file.read_exact(&mut magic).await.ok()?;
    match &magic {
        b"GGUF" => Some(KIND_LLAMA_CPP),
        // Legacy ggml containers store the magic as a little-endian u32.
        b"lmgg" | b"ggml" | b"tjgg" | b"ggjt" | b"fmgg" | b"ggmf" => Some(KIND_GGML),
        _ => None,
    }
}

/// Reserve a free TCP port on the loopback interface. The listener is
/// dropped before the backend binds, so the port is free but not held.
pub fn free_local_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// Full argument list: recipe args first, then the flags every backend
/// understands.
pub fn backend_args(
    recipe: &LaunchRecipe,
    addr: &str,
    model_path: &Path,
    options: &LoadOptions,
) -> Vec<String> {
    let mut args = recipe.args.clone();
    args.extend([
        "--addr".to_string(),
        addr.to_string(),
        "--model".to_string(),
        model_path.to_string_lossy().into_owned(),
        "--threads".to_string(),
        options.threads.to_string(),
        "--context-size".to_string(),
        options.context_size.to_string(),
        "--gpu-layers".to_string(),
        options.gpu_layers.to_string(),
    ]);
    args
}
