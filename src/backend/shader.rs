// Shader module loading
//
// Vulkan consumes SPIR-V words. The two blobs live side by side in one
// directory: vertex.spirv and fragment.spirv.

use ash::vk;
use std::fs::File;
use std::path::{Path, PathBuf};

use super::device::VulkanDevice;
use super::error::{RendererError, RendererResult, VkResultExt};

pub const VERTEX_SHADER_FILE: &str = "vertex.spirv";
pub const FRAGMENT_SHADER_FILE: &str = "fragment.spirv";

/// Read a SPIR-V file into properly aligned words
pub fn load_spirv(path: &Path) -> RendererResult<Vec<u32>> {
    let shader_load = |source| RendererError::ShaderLoad {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).map_err(shader_load)?;
    ash::util::read_spv(&mut file).map_err(shader_load)
}

/// Paths of the vertex and fragment blobs inside `directory`
pub fn shader_paths(directory: &Path) -> (PathBuf, PathBuf) {
    (
        directory.join(VERTEX_SHADER_FILE),
        directory.join(FRAGMENT_SHADER_FILE),
    )
}

/// Shader module, destroyed on drop
pub struct ShaderModule<'a> {
    pub handle: vk::ShaderModule,
    device: &'a VulkanDevice,
}

impl<'a> ShaderModule<'a> {
    pub fn new(device: &'a VulkanDevice, code: &[u32]) -> RendererResult<Self> {
        let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

        let handle = unsafe { device.device.create_shader_module(&create_info, None) }
            .resource("vkCreateShaderModule")?;

        Ok(Self { handle, device })
    }

    pub fn load(device: &'a VulkanDevice, path: &Path) -> RendererResult<Self> {
        let code = load_spirv(path)?;
        log::debug!("Loaded {} ({} words)", path.display(), code.len());
        Self::new(device, &code)
    }
}

impl Drop for ShaderModule<'_> {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_shader_module(self.handle, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(name: &str, bytes: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("quad-presenter-{}-{}", std::process::id(), name));
        let mut file = File::create(&path).unwrap();
        file.write_all(bytes).unwrap();
        path
    }

    #[test]
    fn reads_words_in_file_order() {
        // SPIR-V magic followed by one more word, little endian
        let mut bytes = 0x0723_0203u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&42u32.to_le_bytes());
        let path = temp_file("ok.spirv", &bytes);

        let words = load_spirv(&path).unwrap();
        assert_eq!(words, vec![0x0723_0203, 42]);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn rejects_truncated_blob() {
        let path = temp_file("short.spirv", &[0x03, 0x02, 0x23]);

        let err = load_spirv(&path).unwrap_err();
        assert!(matches!(err, RendererError::ShaderLoad { .. }));

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = load_spirv(Path::new("does/not/exist/vertex.spirv")).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("vertex.spirv"));
        assert!(message.contains("glslc"));
    }

    #[test]
    fn fixed_two_file_layout() {
        let (vert, frag) = shader_paths(Path::new("shaders"));
        assert_eq!(vert, Path::new("shaders/vertex.spirv"));
        assert_eq!(frag, Path::new("shaders/fragment.spirv"));
    }
}
