// Swapchain - Window presentation
//
// Negotiation is split from creation: `SwapchainPlan::negotiate` is a pure
// function of the surface support snapshot, the window's drawable size and
// the queue families. `SwapchainState` owns the swapchain, one image view
// and one framebuffer per image, and is only ever replaced as a whole.

use ash::vk;
use std::sync::Arc;

use super::device::{QueueFamilies, VulkanDevice};
use super::error::{RendererError, RendererResult, VkResultExt};
use super::pipeline::create_framebuffer;

/// 8-bit BGR without alpha, sRGB encoded
pub const PREFERRED_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8_SRGB,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

/// Current-extent value meaning "the swapchain decides"
pub const UNDEFINED_EXTENT: u32 = u32::MAX;

/// What the surface reports; queried fresh for every (re)creation
#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    pub fn query(device: &VulkanDevice) -> RendererResult<Self> {
        let presentation = device.presentation()?;
        let loader = &presentation.surface_loader;
        let surface = presentation.surface;

        unsafe {
            Ok(Self {
                capabilities: loader
                    .get_physical_device_surface_capabilities(device.physical_device, surface)
                    .resource("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?,
                formats: loader
                    .get_physical_device_surface_formats(device.physical_device, surface)
                    .resource("vkGetPhysicalDeviceSurfaceFormatsKHR")?,
                present_modes: loader
                    .get_physical_device_surface_present_modes(device.physical_device, surface)
                    .resource("vkGetPhysicalDeviceSurfacePresentModesKHR")?,
            })
        }
    }
}

/// Preferred format if offered, else the first one reported
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| **f == PREFERRED_FORMAT)
        .or_else(|| formats.first())
        .copied()
}

/// Mailbox if offered, else the first mode reported
pub fn choose_present_mode(modes: &[vk::PresentModeKHR]) -> Option<vk::PresentModeKHR> {
    modes
        .iter()
        .copied()
        .find(|&mode| mode == vk::PresentModeKHR::MAILBOX)
        .or_else(|| modes.first().copied())
}

/// Surface-dictated extent, or the drawable size clamped per axis
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    drawable: vk::Extent2D,
) -> vk::Extent2D {
    let current = capabilities.current_extent;
    if current.width != UNDEFINED_EXTENT || current.height != UNDEFINED_EXTENT {
        return current;
    }

    let min = capabilities.min_image_extent;
    let max = capabilities.max_image_extent;
    vk::Extent2D {
        width: drawable.width.max(min.width).min(max.width),
        height: drawable.height.max(min.height).min(max.height),
    }
}

/// One more than the minimum, capped by the maximum (0 = no maximum)
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let image_count = capabilities.min_image_count + 1;
    if capabilities.max_image_count == 0 {
        image_count
    } else {
        image_count.min(capabilities.max_image_count)
    }
}

/// How swapchain images are shared between the graphics and present queues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSharing {
    Exclusive,
    Concurrent([u32; 2]),
}

impl ImageSharing {
    pub fn for_families(families: QueueFamilies) -> Self {
        if families.graphics == families.present {
            Self::Exclusive
        } else {
            Self::Concurrent([families.graphics, families.present])
        }
    }

    pub fn mode(&self) -> vk::SharingMode {
        match self {
            Self::Exclusive => vk::SharingMode::EXCLUSIVE,
            Self::Concurrent(_) => vk::SharingMode::CONCURRENT,
        }
    }

    pub fn queue_family_indices(&self) -> &[u32] {
        match self {
            Self::Exclusive => &[],
            Self::Concurrent(families) => families,
        }
    }
}

/// Everything chosen for one swapchain, before any handle exists
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwapchainPlan {
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub sharing: ImageSharing,
}

impl SwapchainPlan {
    pub fn negotiate(
        support: &SurfaceSupport,
        drawable: vk::Extent2D,
        families: QueueFamilies,
    ) -> RendererResult<Self> {
        let unsupported = |op| RendererError::ResourceCreation {
            op,
            result: vk::Result::ERROR_FORMAT_NOT_SUPPORTED,
        };

        let format = choose_surface_format(&support.formats)
            .ok_or_else(|| unsupported("vkGetPhysicalDeviceSurfaceFormatsKHR"))?;
        let present_mode = choose_present_mode(&support.present_modes)
            .ok_or_else(|| unsupported("vkGetPhysicalDeviceSurfacePresentModesKHR"))?;

        Ok(Self {
            pre_transform: support.capabilities.current_transform,
            format,
            present_mode,
            extent: choose_extent(&support.capabilities, drawable),
            image_count: choose_image_count(&support.capabilities),
            sharing: ImageSharing::for_families(families),
        })
    }

    /// A minimized window has no area to present into
    pub fn is_drawable(&self) -> bool {
        self.extent.width > 0 && self.extent.height > 0
    }

    /// Plan a replacement for a swapchain whose render pass was built for
    /// `surface_format`. That format is kept for as long as the surface
    /// still offers it. `None` while the window has no drawable area.
    pub fn renegotiate(
        support: &SurfaceSupport,
        drawable: vk::Extent2D,
        families: QueueFamilies,
        surface_format: vk::SurfaceFormatKHR,
    ) -> RendererResult<Option<Self>> {
        let mut plan = Self::negotiate(support, drawable, families)?;
        if !plan.is_drawable() {
            return Ok(None);
        }

        if support.formats.contains(&surface_format) {
            plan.format = surface_format;
        } else if plan.format.format != surface_format.format {
            return Err(RendererError::SurfaceFormatChanged {
                expected: surface_format.format,
                found: plan.format.format,
            });
        }

        Ok(Some(plan))
    }
}

/// Result of asking for the next presentable image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Image { index: u32, suboptimal: bool },
    OutOfDate,
}

/// Result of a present request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Presented,
    /// Out of date or suboptimal; the swapchain must be recreated
    Stale,
}

/// Sort an acquire result into usable image, staleness, or fatal error
pub fn classify_acquire(result: ash::prelude::VkResult<(u32, bool)>) -> RendererResult<Acquire> {
    match result {
        Ok((index, suboptimal)) => Ok(Acquire::Image { index, suboptimal }),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquire::OutOfDate),
        Err(result) => Err(RendererError::Submission {
            op: "vkAcquireNextImageKHR",
            result,
        }),
    }
}

/// Sort a present result into presented, stale, or fatal error
pub fn classify_present(result: ash::prelude::VkResult<bool>) -> RendererResult<PresentStatus> {
    match result {
        Ok(false) => Ok(PresentStatus::Presented),
        Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentStatus::Stale),
        Err(result) => Err(RendererError::Submission {
            op: "vkQueuePresentKHR",
            result,
        }),
    }
}

pub struct SwapchainState {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub plan: SwapchainPlan,
    device: Arc<VulkanDevice>,
}

impl SwapchainState {
    pub fn new(
        device: &Arc<VulkanDevice>,
        plan: SwapchainPlan,
        render_pass: vk::RenderPass,
    ) -> RendererResult<Self> {
        log::info!(
            "Creating swapchain: {}x{}, {} images, {:?}, {:?}",
            plan.extent.width,
            plan.extent.height,
            plan.image_count,
            plan.format.format,
            plan.present_mode
        );

        let presentation = device.presentation()?;

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(presentation.surface)
            .min_image_count(plan.image_count)
            .image_format(plan.format.format)
            .image_color_space(plan.format.color_space)
            .image_extent(plan.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(plan.sharing.mode())
            .queue_family_indices(plan.sharing.queue_family_indices())
            .pre_transform(plan.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(plan.present_mode)
            .clipped(true)
            .old_swapchain(vk::SwapchainKHR::null());

        let swapchain = unsafe {
            presentation
                .swapchain_loader
                .create_swapchain(&create_info, None)
        }
        .resource("vkCreateSwapchainKHR")?;

        // From here on drop tears down whatever got created
        let mut state = Self {
            swapchain,
            images: Vec::new(),
            image_views: Vec::new(),
            framebuffers: Vec::new(),
            plan,
            device: device.clone(),
        };

        state.images = unsafe { presentation.swapchain_loader.get_swapchain_images(swapchain) }
            .resource("vkGetSwapchainImagesKHR")?;

        let mut targets = DeviceImageTargets {
            device,
            format: plan.format.format,
            render_pass,
            extent: plan.extent,
        };
        let (image_views, framebuffers) = build_image_targets(&mut targets, &state.images)?;
        state.image_views = image_views;
        state.framebuffers = framebuffers;

        log::info!("Created swapchain with {} images", state.images.len());

        Ok(state)
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.plan.extent
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Acquire next image, signaling `semaphore` once it is usable
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> RendererResult<Acquire> {
        let presentation = self.device.presentation()?;
        classify_acquire(unsafe {
            presentation.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        })
    }

    /// Present `image_index` once `wait_semaphore` is signaled
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> RendererResult<PresentStatus> {
        let presentation = self.device.presentation()?;

        let wait_semaphores = [wait_semaphore];
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        classify_present(unsafe {
            presentation
                .swapchain_loader
                .queue_present(queue, &present_info)
        })
    }
}

impl Drop for SwapchainState {
    fn drop(&mut self) {
        // Reverse of creation; the images belong to the swapchain
        unsafe {
            for &framebuffer in &self.framebuffers {
                self.device.device.destroy_framebuffer(framebuffer, None);
            }
            for &view in &self.image_views {
                self.device.device.destroy_image_view(view, None);
            }
            if let Ok(presentation) = self.device.presentation() {
                presentation
                    .swapchain_loader
                    .destroy_swapchain(self.swapchain, None);
            }
        }
    }
}

/// Per-image attachments of a swapchain
pub trait ImageTargets {
    fn create_view(&mut self, image: vk::Image) -> RendererResult<vk::ImageView>;
    fn create_framebuffer(&mut self, view: vk::ImageView) -> RendererResult<vk::Framebuffer>;
    fn destroy_view(&mut self, view: vk::ImageView);
    fn destroy_framebuffer(&mut self, framebuffer: vk::Framebuffer);
}

/// One view and one framebuffer per image, in image order. If any
/// creation fails, whatever was built so far is destroyed again.
pub fn build_image_targets<T: ImageTargets>(
    targets: &mut T,
    images: &[vk::Image],
) -> RendererResult<(Vec<vk::ImageView>, Vec<vk::Framebuffer>)> {
    let mut views = Vec::with_capacity(images.len());
    let mut framebuffers = Vec::with_capacity(images.len());

    let built: RendererResult<()> = images.iter().try_for_each(|&image| {
        let view = targets.create_view(image)?;
        views.push(view);
        framebuffers.push(targets.create_framebuffer(view)?);
        Ok(())
    });

    if let Err(e) = built {
        for &framebuffer in framebuffers.iter().rev() {
            targets.destroy_framebuffer(framebuffer);
        }
        for &view in views.iter().rev() {
            targets.destroy_view(view);
        }
        return Err(e);
    }

    Ok((views, framebuffers))
}

struct DeviceImageTargets<'a> {
    device: &'a VulkanDevice,
    format: vk::Format,
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
}

impl ImageTargets for DeviceImageTargets<'_> {
    fn create_view(&mut self, image: vk::Image) -> RendererResult<vk::ImageView> {
        create_image_view(self.device, image, self.format)
    }

    fn create_framebuffer(&mut self, view: vk::ImageView) -> RendererResult<vk::Framebuffer> {
        create_framebuffer(self.device, self.render_pass, view, self.extent)
    }

    fn destroy_view(&mut self, view: vk::ImageView) {
        unsafe { self.device.device.destroy_image_view(view, None) };
    }

    fn destroy_framebuffer(&mut self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.device.destroy_framebuffer(framebuffer, None) };
    }
}

fn create_image_view(
    device: &VulkanDevice,
    image: vk::Image,
    format: vk::Format,
) -> RendererResult<vk::ImageView> {
    let create_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    unsafe { device.device.create_image_view(&create_info, None) }.resource("vkCreateImageView")
}
