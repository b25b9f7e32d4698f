// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Surface creation through the window system's factory
// - Physical device selection (prefer discrete GPU)
// - Logical device + multiplexed queue creation
// - Memory allocator setup (gpu-allocator)
// - Transfer command pool and fences for the upload worker
//
// Implements `Gpu`, so everything above this file is backend agnostic.

use anyhow::{Context, Result};
use ash::extensions::{ext::DebugUtils, khr};
use ash::prelude::VkResult;
use ash::{vk, Entry};
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator as GpuAllocator,
};
use parking_lot::Mutex;
use std::ffi::{CStr, CString};
use std::ptr::NonNull;
use std::sync::Arc;

use super::gpu::{Gpu, ViewDesc};
use super::memory::{
    AllocInfo, AllocationBlock, Allocator, BufferCreateInfo, ImageCreateInfo, MemoryUsage,
    RawBuffer, RawImage, Sharing,
};
use super::queue::{select, QueueFamily, QueueMultiplex, QueueRole, QueueSelect, QueueSelection};
use super::swapchain::{Presenter, SwapchainDesc};
use super::transfer::{TransferOp, TransferQueue};

/// Required Vulkan device features
const REQUIRED_DEVICE_FEATURES: vk::PhysicalDeviceFeatures = vk::PhysicalDeviceFeatures {
    sampler_anisotropy: vk::TRUE,
    ..unsafe { std::mem::zeroed() }
};

#[derive(Debug, Clone)]
pub struct DeviceCreateInfo {
    pub app_name: String,
    pub validation: bool,
    pub queue_select: QueueSelect,
    /// Instance extensions the window system needs for its surface
    pub surface_extensions: Vec<&'static CStr>,
}

impl Default for DeviceCreateInfo {
    fn default() -> Self {
        Self {
            app_name: "gpu-core".to_string(),
            validation: cfg!(debug_assertions),
            queue_select: QueueSelect::Auto,
            surface_extensions: Vec::new(),
        }
    }
}

/// Transfer-side command objects; only the upload worker records
struct TransferPool {
    pool: vk::CommandPool,
    free_fences: Vec<vk::Fence>,
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Taken in Drop, before the device is destroyed
    allocator: Mutex<Option<GpuAllocator>>,
    transfer: Mutex<TransferPool>,
    queues: QueueMultiplex,
    swapchain_loader: khr::Swapchain,
    surface: vk::SurfaceKHR,
    surface_loader: khr::Surface,

    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    // Debug utils (if validation enabled)
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,

    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl VulkanDevice {
    /// Create Vulkan device
    ///
    /// `make_surface` is called once the instance exists; the device takes
    /// ownership of the surface it returns.
    pub fn new(
        info: &DeviceCreateInfo,
        make_surface: impl FnOnce(&Entry, &ash::Instance) -> Result<vk::SurfaceKHR>,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", info.app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        // Step 2: Create instance
        let instance = Self::create_instance(&entry, info)?;

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if info.validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        // Step 4: Surface from the window system
        let surface = make_surface(&entry, &instance).context("Failed to create Vulkan surface")?;
        let surface_loader = khr::Surface::new(&entry, &instance);

        // Step 5: Pick physical device (GPU) and reserve its queues
        let (physical_device, families, selection) =
            Self::pick_physical_device(&instance, &surface_loader, surface, info.queue_select)?;

        // Step 6: Create logical device
        let device = Self::create_logical_device(&instance, physical_device, &selection)?;
        let queues = QueueMultiplex::new(&selection, &families, |family, index| unsafe {
            device.get_device_queue(family, index)
        });

        // Step 7: Cache device properties
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        // Step 8: Create memory allocator
        let allocator = Self::create_allocator(&instance, physical_device, &device)?;

        // Step 9: Transfer command pool
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queues.queue(QueueRole::Transfer).id.family_index)
            .flags(
                vk::CommandPoolCreateFlags::TRANSIENT
                    | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            );
        let pool = unsafe { device.create_command_pool(&pool_info, None) }
            .context("Failed to create transfer command pool")?;

        let swapchain_loader = khr::Swapchain::new(&instance, &device);

        Ok(Arc::new(Self {
            allocator: Mutex::new(Some(allocator)),
            transfer: Mutex::new(TransferPool { pool, free_fences: Vec::new() }),
            queues,
            swapchain_loader,
            surface,
            surface_loader,
            device,
            physical_device,
            instance,
            _entry: entry,
            debug_utils,
            properties,
            memory_properties,
        }))
    }

    fn create_instance(entry: &Entry, info: &DeviceCreateInfo) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(info.app_name.as_str())?;
        let engine_name = CString::new("gpu-core")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let mut extensions = vec![khr::Surface::name().as_ptr()];
        extensions.extend(info.surface_extensions.iter().map(|name| name.as_ptr()));
        if info.validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        // Validation layers
        let layer_names = if info.validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
        queue_select: QueueSelect,
    ) -> Result<(vk::PhysicalDevice, Vec<QueueFamily>, QueueSelection)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        // Score each device
        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            let features = unsafe { instance.get_physical_device_features(device) };

            if !Self::check_device_features(&features) {
                continue;
            }

            let families = queue_select
                .restrict(QueueFamily::enumerate(instance, device, surface_loader, surface)?);
            let Some(selection) = select(families.clone()) else {
                continue;
            };

            // Prefer discrete GPU
            let score = match props.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                _ => 1,
            };

            if score > best_score {
                best_score = score;
                best_device = Some((device, families, selection));
            }
        }

        best_device.ok_or_else(|| anyhow::anyhow!("No GPU with graphics and present queues found"))
    }

    fn check_device_features(features: &vk::PhysicalDeviceFeatures) -> bool {
        features.sampler_anisotropy == vk::TRUE
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        selection: &QueueSelection,
    ) -> Result<ash::Device> {
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = selection
            .requests
            .iter()
            .map(|request| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(request.family_index)
                    .queue_priorities(&request.priorities)
                    .build()
            })
            .collect();

        let extensions = [khr::Swapchain::name().as_ptr()];

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&REQUIRED_DEVICE_FEATURES);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        Ok(device)
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<GpuAllocator> {
        let allocator = GpuAllocator::new(&gpu_allocator::vulkan::AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create memory allocator")?;

        Ok(allocator)
    }

    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        usage: MemoryUsage,
        linear: bool,
    ) -> Result<Allocation> {
        let mut allocator = self.allocator.lock();
        let allocator = allocator.as_mut().context("Memory allocator already destroyed")?;
        let allocation = allocator.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: usage.location(),
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;
        Ok(allocation)
    }

    fn free(&self, block: AllocationBlock) {
        let Some(allocation) = block.take::<Allocation>() else {
            log::error!("Freeing an allocation that gpu-allocator did not hand out");
            return;
        };
        if let Some(allocator) = self.allocator.lock().as_mut() {
            if let Err(e) = allocator.free(allocation) {
                log::error!("Failed to free allocation: {}", e);
            }
        }
    }

    fn alloc_info(allocation: &Allocation) -> AllocInfo {
        AllocInfo {
            memory: unsafe { allocation.memory() },
            offset: allocation.offset(),
            actual_size: allocation.size(),
        }
    }

    /// Submit rendering work on the queue backing `role`
    pub fn submit(
        &self,
        role: QueueRole,
        submits: &[vk::SubmitInfo],
        fence: vk::Fence,
    ) -> Result<()> {
        let queue = self.queues.queue(role).queue;
        let _lock = self.queues.lock(role);
        unsafe { self.device.queue_submit(queue, submits, fence) }.context("Queue submit failed")?;
        Ok(())
    }

    pub fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::builder();
        Ok(unsafe { self.device.create_semaphore(&info, None) }?)
    }

    pub fn create_fence(&self, signalled: bool) -> Result<vk::Fence> {
        let flags = if signalled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::builder().flags(flags);
        Ok(unsafe { self.device.create_fence(&info, None) }?)
    }

    pub fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe { self.device.reset_fences(&[fence]) }?;
        Ok(())
    }

    /// Command pool for recording on the queue backing `role`
    pub fn create_command_pool(&self, role: QueueRole) -> Result<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(self.queues.queue(role).id.family_index)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        Ok(unsafe { self.device.create_command_pool(&info, None) }?)
    }

    fn record_op(&self, command: vk::CommandBuffer, op: &TransferOp) {
        match op {
            TransferOp::CopyBuffer { src, dst, size } => {
                let region = vk::BufferCopy { src_offset: 0, dst_offset: 0, size: *size };
                unsafe { self.device.cmd_copy_buffer(command, *src, *dst, &[region]) };
            }
            TransferOp::Barrier {
                image,
                layers,
                old_layout,
                new_layout,
                src_access,
                dst_access,
                src_stage,
                dst_stage,
            } => {
                let barrier = vk::ImageMemoryBarrier::builder()
                    .old_layout(*old_layout)
                    .new_layout(*new_layout)
                    .src_access_mask(*src_access)
                    .dst_access_mask(*dst_access)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(*image)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: *layers,
                    })
                    .build();
                unsafe {
                    self.device.cmd_pipeline_barrier(
                        command,
                        *src_stage,
                        *dst_stage,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[],
                        &[barrier],
                    )
                };
            }
            TransferOp::CopyBufferToImage { src, dst, regions } => unsafe {
                self.device.cmd_copy_buffer_to_image(
                    command,
                    *src,
                    *dst,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    regions,
                )
            },
        }
    }
}

impl Allocator for VulkanDevice {
    fn create_buffer(&self, info: &BufferCreateInfo, sharing: &Sharing) -> Result<RawBuffer> {
        let create_info = vk::BufferCreateInfo::builder()
            .size(info.size)
            .usage(info.usage)
            .sharing_mode(sharing.mode)
            .queue_family_indices(sharing.indices());
        let buffer = unsafe { self.device.create_buffer(&create_info, None) }
            .with_context(|| format!("Failed to create buffer [{}]", info.name))?;

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let allocation = match self.allocate(&info.name, requirements, info.memory, true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e.context(format!("Failed to allocate buffer [{}]", info.name)));
            }
        };
        let bound = unsafe {
            self.device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            self.free(AllocationBlock::new(allocation));
            unsafe { self.device.destroy_buffer(buffer, None) };
            anyhow::bail!("Failed to bind buffer [{}]: {}", info.name, e);
        }

        Ok(RawBuffer {
            buffer,
            info: Self::alloc_info(&allocation),
            block: AllocationBlock::new(allocation),
        })
    }

    fn destroy_buffer(&self, buffer: RawBuffer) {
        unsafe { self.device.destroy_buffer(buffer.buffer, None) };
        self.free(buffer.block);
    }

    fn map_buffer(&self, buffer: &RawBuffer) -> Option<NonNull<u8>> {
        buffer.block.get::<Allocation>()?.mapped_ptr().map(|ptr| ptr.cast::<u8>())
    }

    fn create_image(&self, info: &ImageCreateInfo, sharing: &Sharing) -> Result<RawImage> {
        let create_info = vk::ImageCreateInfo::builder()
            .flags(info.flags)
            .image_type(vk::ImageType::TYPE_2D)
            .format(info.format)
            .extent(vk::Extent3D { depth: info.extent.depth.max(1), ..info.extent })
            .mip_levels(1)
            .array_layers(info.layers.max(1))
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(info.tiling)
            .usage(info.usage)
            .sharing_mode(sharing.mode)
            .queue_family_indices(sharing.indices())
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&create_info, None) }
            .with_context(|| format!("Failed to create image [{}]", info.name))?;

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let linear = info.tiling == vk::ImageTiling::LINEAR;
        let allocation = match self.allocate(&info.name, requirements, info.memory, linear) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e.context(format!("Failed to allocate image [{}]", info.name)));
            }
        };
        let bound = unsafe {
            self.device.bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            self.free(AllocationBlock::new(allocation));
            unsafe { self.device.destroy_image(image, None) };
            anyhow::bail!("Failed to bind image [{}]: {}", info.name, e);
        }

        Ok(RawImage {
            image,
            info: Self::alloc_info(&allocation),
            block: AllocationBlock::new(allocation),
        })
    }

    fn destroy_image(&self, image: RawImage) {
        unsafe { self.device.destroy_image(image.image, None) };
        self.free(image.block);
    }
}

impl TransferQueue for VulkanDevice {
    fn alloc_commands(&self) -> Result<vk::CommandBuffer> {
        let transfer = self.transfer.lock();
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(transfer.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let commands = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate transfer command buffer")?;
        commands.into_iter().next().context("Driver returned no command buffer")
    }

    fn free_commands(&self, command: vk::CommandBuffer) {
        let transfer = self.transfer.lock();
        unsafe { self.device.free_command_buffers(transfer.pool, &[command]) };
    }

    fn begin_commands(&self, command: vk::CommandBuffer) -> Result<()> {
        let _pool = self.transfer.lock();
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(command, &begin_info) }
            .context("Failed to begin transfer commands")?;
        Ok(())
    }

    fn record(&self, command: vk::CommandBuffer, op: &TransferOp) {
        let _pool = self.transfer.lock();
        self.record_op(command, op);
    }

    fn end_commands(&self, command: vk::CommandBuffer) -> Result<()> {
        let _pool = self.transfer.lock();
        unsafe { self.device.end_command_buffer(command) }
            .context("Failed to end transfer commands")?;
        Ok(())
    }

    fn submit_transfer(&self, commands: &[vk::CommandBuffer]) -> Result<vk::Fence> {
        let recycled = self.transfer.lock().free_fences.pop();
        let fence = match recycled {
            Some(fence) => {
                self.reset_fence(fence)?;
                fence
            }
            None => self.create_fence(false)?,
        };

        let submit = vk::SubmitInfo::builder().command_buffers(commands).build();
        if let Err(e) = self.submit(QueueRole::Transfer, &[submit], fence) {
            self.transfer.lock().free_fences.push(fence);
            return Err(e);
        }
        Ok(fence)
    }

    fn fence_signalled(&self, fence: vk::Fence) -> Result<bool> {
        Ok(unsafe { self.device.get_fence_status(fence) }?)
    }

    fn release_fence(&self, fence: vk::Fence) {
        self.transfer.lock().free_fences.push(fence);
    }
}

impl Presenter for VulkanDevice {
    fn surface_capabilities(&self) -> Result<vk::SurfaceCapabilitiesKHR> {
        Ok(unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
        }?)
    }

    fn surface_formats(&self) -> Result<Vec<vk::SurfaceFormatKHR>> {
        Ok(unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(self.physical_device, self.surface)
        }?)
    }

    fn surface_present_modes(&self) -> Result<Vec<vk::PresentModeKHR>> {
        Ok(unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(self.physical_device, self.surface)
        }?)
    }

    fn supports_depth_format(&self, format: vk::Format) -> bool {
        let props = unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, format)
        };
        props.optimal_tiling_features.contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> Result<vk::SwapchainKHR> {
        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(desc.min_image_count)
            .image_format(desc.format.format)
            .image_color_space(desc.format.color_space)
            .image_extent(desc.extent)
            .image_array_layers(1)
            .image_usage(desc.usage)
            .image_sharing_mode(desc.sharing.mode)
            .queue_family_indices(desc.sharing.indices())
            .pre_transform(desc.pre_transform)
            .composite_alpha(desc.composite_alpha)
            .present_mode(desc.present_mode)
            .clipped(true)
            .old_swapchain(desc.old_swapchain);

        Ok(unsafe { self.swapchain_loader.create_swapchain(&create_info, None) }?)
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>> {
        Ok(unsafe { self.swapchain_loader.get_swapchain_images(swapchain) }?)
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) };
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        unsafe {
            self.swapchain_loader.acquire_next_image(
                swapchain,
                u64::MAX,
                signal,
                vk::Fence::null(),
            )
        }
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        index: u32,
        wait: vk::Semaphore,
    ) -> VkResult<bool> {
        let waits = [wait];
        let swapchains = [swapchain];
        let indices = [index];
        let wait_semaphores: &[vk::Semaphore] =
            if wait == vk::Semaphore::null() { &[] } else { &waits };
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&indices);

        let queue = self.queues.queue(QueueRole::Present).queue;
        let _lock = self.queues.lock(QueueRole::Present);
        unsafe { self.swapchain_loader.queue_present(queue, &present_info) }
    }
}

impl Gpu for VulkanDevice {
    fn queues(&self) -> &QueueMultiplex {
        &self.queues
    }

    fn wait_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> Result<bool> {
        match unsafe { self.device.wait_for_fences(fences, true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn wait_idle(&self) -> Result<()> {
        // vkDeviceWaitIdle needs every queue externally synchronised
        let _graphics = self.queues.lock(QueueRole::Graphics);
        let _transfer = if self.queues.shares_lock(QueueRole::Graphics, QueueRole::Transfer) {
            None
        } else {
            Some(self.queues.lock(QueueRole::Transfer))
        };
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }

    fn create_image_view(&self, desc: &ViewDesc) -> Result<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(desc.image)
            .view_type(desc.view_type)
            .format(desc.format)
            .components(vk::ComponentMapping::default())
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: desc.aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: desc.layers.max(1),
            });

        unsafe { self.device.create_image_view(&create_info, None) }
            .context("Failed to create image view")
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) };
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        if let Err(e) = Gpu::wait_idle(self) {
            log::error!("Device wait idle failed: {e:#}");
        }

        // Cleanup in reverse order
        unsafe {
            let transfer = self.transfer.get_mut();
            for fence in transfer.free_fences.drain(..) {
                self.device.destroy_fence(fence, None);
            }
            self.device.destroy_command_pool(transfer.pool, None);

            // Remaining allocations are reported as leaks by gpu-allocator
            drop(self.allocator.get_mut().take());

            self.surface_loader.destroy_surface(self.surface, None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
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
