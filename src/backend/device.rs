// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with optional validation layers
// - Surface creation for the window (when presenting)
// - Physical device selection (prefer discrete GPU)
// - Logical device + graphics/present queue creation
//
// This is the explicit context object every backend operation borrows.

use ash::extensions::{ext::DebugUtils, khr};
use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

use super::error::{RendererError, RendererResult, VkResultExt};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Raw handles of the window we present to
#[derive(Clone, Copy)]
pub struct PresentTarget {
    pub display: RawDisplayHandle,
    pub window: RawWindowHandle,
}

/// Surface plus the loaders needed to negotiate and drive a swapchain on it
pub struct Presentation {
    pub surface: vk::SurfaceKHR,
    pub surface_loader: khr::Surface,
    pub swapchain_loader: khr::Swapchain,
}

/// Queue families chosen for graphics submission and presentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    /// Distinct family indices, graphics first
    pub fn unique(&self) -> Vec<u32> {
        if self.graphics == self.present {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Vulkan handles (order matters for drop!)
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    // Queue handles (may be the same queue)
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub queue_families: QueueFamilies,

    presentation: Option<Presentation>,

    // Debug utils (if validation enabled)
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl VulkanDevice {
    /// Create Vulkan device
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `enable_validation` - Enable Vulkan validation layers
    /// * `target` - Window to present to; `None` builds a headless device
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        target: Option<PresentTarget>,
    ) -> RendererResult<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }?;

        let enable_validation = enable_validation && Self::validation_available(&entry);

        // Until the device exists, every early return unwinds what was made
        let mut teardown = Teardown::default();

        // Step 2: Create instance
        let instance = Self::create_instance(&entry, app_name, enable_validation, target)?;
        let owned = instance.clone();
        teardown.push(move || unsafe { owned.destroy_instance(None) });

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if enable_validation {
            let (debug_utils, messenger) = Self::setup_debug_messenger(&entry, &instance)?;
            let owned = debug_utils.clone();
            teardown.push(move || unsafe { owned.destroy_debug_utils_messenger(messenger, None) });
            Some((debug_utils, messenger))
        } else {
            None
        };

        // Step 4: Surface for the window
        let surface = match target {
            Some(target) => {
                let surface = unsafe {
                    ash_window::create_surface(&entry, &instance, target.display, target.window, None)
                }
                .init("vkCreateSurfaceKHR")?;
                let loader = khr::Surface::new(&entry, &instance);
                let owned = loader.clone();
                teardown.push(move || unsafe { owned.destroy_surface(surface, None) });
                Some((loader, surface))
            }
            None => None,
        };

        // Step 5: Pick physical device (GPU)
        let (physical_device, queue_families) = Self::pick_physical_device(
            &instance,
            surface.as_ref().map(|(loader, surface)| (loader, *surface)),
        )?;

        // Step 6: Create logical device
        let device = Self::create_logical_device(
            &instance,
            physical_device,
            queue_families,
            surface.is_some(),
        )?;

        // Nothing below can fail; Drop for VulkanDevice takes over
        teardown.disarm();

        let graphics_queue = unsafe { device.get_device_queue(queue_families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(queue_families.present, 0) };

        // Step 7: Cache device properties
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let presentation = surface.map(|(surface_loader, surface)| Presentation {
            surface,
            surface_loader,
            swapchain_loader: khr::Swapchain::new(&instance, &device),
        });

        let vulkan = Self {
            device,
            physical_device,
            instance,
            _entry: entry,
            graphics_queue,
            present_queue,
            queue_families,
            presentation,
            debug_utils,
            properties,
            memory_properties,
        };

        log::info!("Selected GPU: {}", vulkan.device_name());
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(vulkan.properties.api_version),
            vk::api_version_minor(vulkan.properties.api_version),
            vk::api_version_patch(vulkan.properties.api_version)
        );
        log::info!(
            "Queue families: graphics {}, present {}",
            queue_families.graphics,
            queue_families.present
        );

        Ok(Arc::new(vulkan))
    }

    pub fn device_name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }

    /// Device without a surface; graphics queue doubles as present queue
    #[cfg(test)]
    pub fn headless(app_name: &str) -> RendererResult<Arc<Self>> {
        Self::new(app_name, false, None)
    }

    /// Surface and swapchain loaders; only present when built for a window
    pub fn presentation(&self) -> RendererResult<&Presentation> {
        self.presentation
            .as_ref()
            .ok_or(RendererError::Initialization {
                op: "VulkanDevice::presentation",
                result: vk::Result::ERROR_SURFACE_LOST_KHR,
            })
    }

    fn validation_available(entry: &Entry) -> bool {
        let layers = entry.enumerate_instance_layer_properties().unwrap_or_default();
        let found = layers.iter().any(|layer| {
            (unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) }) == VALIDATION_LAYER
        });
        if !found {
            log::warn!(
                "{} not installed, continuing without validation",
                VALIDATION_LAYER.to_string_lossy()
            );
        }
        found
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        target: Option<PresentTarget>,
    ) -> RendererResult<ash::Instance> {
        let app_name_cstr = CString::new(app_name.replace('\0', "")).unwrap_or_default();
        let engine_name = c"No Engine";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_0);

        // Whatever the window system needs to create a surface
        let mut extensions: Vec<*const c_char> = match target {
            Some(target) => ash_window::enumerate_required_extensions(target.display)
                .init("vkEnumerateInstanceExtensionProperties")?
                .to_vec(),
            None => Vec::new(),
        };
        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }.init("vkCreateInstance")?;
        log::info!("Created VkInstance");

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> RendererResult<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .init("vkCreateDebugUtilsMessengerEXT")?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface: Option<(&khr::Surface, vk::SurfaceKHR)>,
    ) -> RendererResult<(vk::PhysicalDevice, QueueFamilies)> {
        let devices =
            unsafe { instance.enumerate_physical_devices() }.init("vkEnumeratePhysicalDevices")?;

        log::info!("Found {} potential physical devices", devices.len());

        // Score each device
        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };

            let Some(families) = Self::find_queue_families(instance, device, surface)? else {
                continue;
            };

            if let Some((loader, surface)) = surface {
                if !Self::supports_swapchain(instance, device)?
                    || !Self::has_surface_support(loader, device, surface)?
                {
                    continue;
                }
            }

            // Score device (prefer discrete GPU)
            let score = match props.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                _ => 1,
            };

            if score > best_score {
                best_score = score;
                best_device = Some((device, families));
            }
        }

        best_device.ok_or(RendererError::NoSuitableDevice)
    }

    /// Prefer one family that does both; otherwise the first of each.
    fn find_queue_families(
        instance: &ash::Instance,
        device: vk::PhysicalDevice,
        surface: Option<(&khr::Surface, vk::SurfaceKHR)>,
    ) -> RendererResult<Option<QueueFamilies>> {
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(device) };

        let mut graphics = None;
        let mut present = None;

        for (index, props) in queue_families.iter().enumerate() {
            let index = index as u32;
            let has_graphics = props.queue_flags.contains(vk::QueueFlags::GRAPHICS);
            let has_present = match surface {
                Some((loader, surface)) => unsafe {
                    loader.get_physical_device_surface_support(device, index, surface)
                }
                .init("vkGetPhysicalDeviceSurfaceSupportKHR")?,
                None => has_graphics,
            };

            if has_graphics && has_present {
                return Ok(Some(QueueFamilies {
                    graphics: index,
                    present: index,
                }));
            }
            if has_graphics && graphics.is_none() {
                graphics = Some(index);
            }
            if has_present && present.is_none() {
                present = Some(index);
            }
        }

        Ok(graphics
            .zip(present)
            .map(|(graphics, present)| QueueFamilies { graphics, present }))
    }

    fn supports_swapchain(instance: &ash::Instance, device: vk::PhysicalDevice) -> RendererResult<bool> {
        let extensions = unsafe { instance.enumerate_device_extension_properties(device) }
            .init("vkEnumerateDeviceExtensionProperties")?;

        Ok(extensions.iter().any(|ext| {
            (unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }) == khr::Swapchain::name()
        }))
    }

    fn has_surface_support(
        loader: &khr::Surface,
        device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> RendererResult<bool> {
        let formats = unsafe { loader.get_physical_device_surface_formats(device, surface) }
            .init("vkGetPhysicalDeviceSurfaceFormatsKHR")?;
        let modes = unsafe { loader.get_physical_device_surface_present_modes(device, surface) }
            .init("vkGetPhysicalDeviceSurfacePresentModesKHR")?;

        Ok(!formats.is_empty() && !modes.is_empty())
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_families: QueueFamilies,
        presenting: bool,
    ) -> RendererResult<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = queue_families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extensions = if presenting {
            vec![khr::Swapchain::name().as_ptr()]
        } else {
            vec![]
        };

        let features = vk::PhysicalDeviceFeatures::default();
        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .init("vkCreateDevice")?;
        log::info!("Created logical device");

        Ok(device)
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> RendererResult<()> {
        unsafe { self.device.device_wait_idle() }.submission("vkDeviceWaitIdle")
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        // Wait for device to finish
        let _ = self.wait_idle();

        // Cleanup in reverse order
        unsafe {
            self.device.destroy_device(None);

            if let Some(presentation) = self.presentation.take() {
                presentation
                    .surface_loader
                    .destroy_surface(presentation.surface, None);
            }

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

/// Destroy calls for a partially built device, run newest first
#[derive(Default)]
struct Teardown {
    steps: Vec<Box<dyn FnOnce()>>,
}

impl Teardown {
    fn push(&mut self, step: impl FnOnce() + 'static) {
        self.steps.push(Box::new(step));
    }

    /// Ownership moved elsewhere; drop without destroying anything
    fn disarm(mut self) {
        self.steps.clear();
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        while let Some(step) = self.steps.pop() {
            step();
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn shared_family_is_listed_once() {
        let families = QueueFamilies {
            graphics: 2,
            present: 2,
        };
        assert_eq!(families.unique(), vec![2]);
    }

    #[test]
    fn distinct_families_keep_graphics_first() {
        let families = QueueFamilies {
            graphics: 0,
            present: 3,
        };
        assert_eq!(families.unique(), vec![0, 3]);
    }

    fn recording(teardown: &mut Teardown, log: &Rc<RefCell<Vec<&'static str>>>, name: &'static str) {
        let log = log.clone();
        teardown.push(move || log.borrow_mut().push(name));
    }

    #[test]
    fn failed_setup_unwinds_newest_first() {
        let log = Rc::new(RefCell::new(Vec::new()));
        {
            let mut teardown = Teardown::default();
            recording(&mut teardown, &log, "instance");
            recording(&mut teardown, &log, "messenger");
            recording(&mut teardown, &log, "surface");
        }
        assert_eq!(*log.borrow(), ["surface", "messenger", "instance"]);
    }

    #[test]
    fn completed_setup_keeps_its_handles() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut teardown = Teardown::default();
        recording(&mut teardown, &log, "instance");
        recording(&mut teardown, &log, "surface");
        teardown.disarm();
        assert!(log.borrow().is_empty());
    }
}
