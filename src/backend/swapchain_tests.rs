use super::*;
use crate::backend::mock::MockGpu;
use ash::vk::Handle;

// ash 0.37 lacks `Handle::is_null` (added in 0.38); same definition.
trait HandleIsNull: Handle {
    fn is_null(self) -> bool;
}

impl<T: Handle> HandleIsNull for T {
    fn is_null(self) -> bool {
        self.as_raw() == 0
    }
}

const FRAMEBUFFER: UVec2 = UVec2::new(800, 600);

fn setup() -> (Arc<MockGpu>, Arc<Vram>, Swapchain) {
    setup_with(|_| {}, SwapchainCreateInfo::default(), FRAMEBUFFER)
}

fn setup_with(
    surface: impl FnOnce(&mut crate::backend::mock::MockSurface),
    info: SwapchainCreateInfo,
    framebuffer: UVec2,
) -> (Arc<MockGpu>, Arc<Vram>, Swapchain) {
    let (gpu, vram) = MockGpu::vram();
    gpu.surface(surface);
    let swapchain = Swapchain::new(vram.clone(), info, framebuffer).unwrap();
    (gpu, vram, swapchain)
}

fn extent(width: u32, height: u32) -> vk::Extent2D {
    vk::Extent2D { width, height }
}

#[test]
fn construction_follows_preferences() {
    let (gpu, _vram, swapchain) = setup();

    assert_eq!(swapchain.colour_format(), vk::Format::B8G8R8A8_SRGB);
    assert_eq!(swapchain.depth_format(), vk::Format::D32_SFLOAT);
    assert_eq!(swapchain.present_mode(), vk::PresentModeKHR::FIFO);
    assert_eq!(swapchain.extent(), extent(800, 600));
    assert_eq!(swapchain.flags(), SwapchainFlags::empty());
    // min_image_count + 1, clamped to the surface maximum
    assert_eq!(swapchain.image_count(), 3);

    let created = gpu.created_swapchains();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].composite_alpha, vk::CompositeAlphaFlagsKHR::OPAQUE);
    assert_eq!(created[0].pre_transform, vk::SurfaceTransformFlagsKHR::IDENTITY);
    assert_eq!(created[0].old_swapchain, vk::SwapchainKHR::null());
    // Three colour views plus the shared depth view
    assert_eq!(gpu.live_views(), 4);
}

#[test]
fn depth_format_falls_back_to_d16() {
    let (_gpu, _vram, swapchain) =
        setup_with(|s| s.depth_formats.clear(), SwapchainCreateInfo::default(), FRAMEBUFFER);
    assert_eq!(swapchain.depth_format(), vk::Format::D16_UNORM);
}

#[test]
fn present_mode_best_fit() {
    let info = SwapchainCreateInfo {
        present_modes: vec![vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO],
        ..Default::default()
    };
    let (_gpu, _vram, mut swapchain) = setup_with(|_| {}, info, FRAMEBUFFER);
    assert_eq!(swapchain.present_mode(), vk::PresentModeKHR::MAILBOX);
    assert_eq!(present_mode_name(swapchain.present_mode()), "Mailbox");

    // Unavailable preference: first available mode
    assert!(swapchain.reconstruct(FRAMEBUFFER, &[vk::PresentModeKHR::IMMEDIATE]));
    assert_eq!(swapchain.present_mode(), vk::PresentModeKHR::FIFO);
    assert_eq!(
        swapchain.available_modes(),
        &[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX]
    );
}

#[test]
fn undefined_surface_extent_uses_clamped_framebuffer() {
    let (_gpu, _vram, swapchain) = setup_with(
        |s| s.caps.current_extent = extent(u32::MAX, u32::MAX),
        SwapchainCreateInfo::default(),
        UVec2::new(5000, 300),
    );
    assert_eq!(swapchain.extent(), extent(4096, 300));
}

#[test]
fn composite_alpha_fallback_order() {
    let (gpu, _vram, _swapchain) = setup_with(
        |s| {
            s.caps.supported_composite_alpha = vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED
                | vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED
        },
        SwapchainCreateInfo::default(),
        FRAMEBUFFER,
    );
    assert_eq!(
        gpu.created_swapchains()[0].composite_alpha,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED
    );
}

#[test]
fn zero_area_construction_is_an_error() {
    let (gpu, vram) = MockGpu::vram();
    gpu.surface(|s| s.caps.current_extent = extent(u32::MAX, u32::MAX));
    assert!(Swapchain::new(vram, SwapchainCreateInfo::default(), UVec2::ZERO).is_err());
    assert_eq!(gpu.live_swapchains(), 0);
}

#[test]
fn paused_until_reconstructed_with_area() {
    let (gpu, _vram, mut swapchain) = setup();

    gpu.surface(|s| s.caps.current_extent = extent(0, 0));
    assert!(!swapchain.reconstruct(UVec2::ZERO, &[]));
    assert!(swapchain.paused());
    assert!(swapchain.acquire_next_image(vk::Semaphore::null()).is_none());
    assert!(!swapchain.present(vk::Semaphore::null(), vk::Fence::null()));

    gpu.surface(|s| s.caps.current_extent = extent(1024, 768));
    assert!(swapchain.reconstruct(UVec2::new(1024, 768), &[]));
    assert!(!swapchain.paused());
    let target = swapchain.acquire_next_image(vk::Semaphore::null()).unwrap();
    assert_eq!(target.extent, extent(1024, 768));
    assert!(swapchain.present(vk::Semaphore::null(), vk::Fence::null()));
}

#[test]
fn out_of_date_acquire_blocks_until_reconstruct() {
    let (gpu, _vram, mut swapchain) = setup();
    gpu.surface(|s| s.acquire.push_back(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)));

    assert!(swapchain.acquire_next_image(vk::Semaphore::null()).is_none());
    assert!(swapchain.out_of_date());
    assert!(swapchain.acquire_next_image(vk::Semaphore::null()).is_none());

    assert!(swapchain.reconstruct(FRAMEBUFFER, &[]));
    assert_eq!(swapchain.flags(), SwapchainFlags::empty());
    assert!(swapchain.acquire_next_image(vk::Semaphore::null()).is_some());
}

#[test]
fn suboptimal_is_sticky_but_not_blocking() {
    let (gpu, _vram, mut swapchain) = setup();
    gpu.surface(|s| s.acquire.push_back(Ok((0, true))));

    assert!(swapchain.acquire_next_image(vk::Semaphore::null()).is_some());
    assert!(swapchain.suboptimal());
    assert!(swapchain.present(vk::Semaphore::null(), vk::Fence::null()));
    assert!(swapchain.acquire_next_image(vk::Semaphore::null()).is_some());
    assert!(swapchain.suboptimal());

    assert!(swapchain.reconstruct(FRAMEBUFFER, &[]));
    assert!(!swapchain.suboptimal());
}

#[test]
fn out_of_date_present_returns_false() {
    let (gpu, _vram, mut swapchain) = setup();
    gpu.surface(|s| s.present.push_back(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)));

    assert!(swapchain.acquire_next_image(vk::Semaphore::null()).is_some());
    assert!(!swapchain.present(vk::Semaphore::null(), vk::Fence::null()));
    assert!(swapchain.out_of_date());
    assert!(gpu.presented().is_empty());
}

#[test]
fn surface_resize_marks_out_of_date() {
    let (gpu, _vram, mut swapchain) = setup();

    assert!(swapchain.acquire_next_image(vk::Semaphore::null()).is_some());
    gpu.surface(|s| s.caps.current_extent = extent(640, 480));
    // The acquired image is still presented
    assert!(swapchain.present(vk::Semaphore::null(), vk::Fence::null()));
    assert!(swapchain.out_of_date());
    assert!(swapchain.acquire_next_image(vk::Semaphore::null()).is_none());

    assert!(swapchain.reconstruct(UVec2::new(640, 480), &[]));
    assert_eq!(swapchain.extent(), extent(640, 480));
}

#[test]
fn failed_reconstruct_blocks_until_rebuilt() {
    // Undefined extent skips the surface size check on acquire
    let (gpu, _vram, mut swapchain) = setup_with(
        |s| s.caps.current_extent = extent(u32::MAX, u32::MAX),
        SwapchainCreateInfo::default(),
        FRAMEBUFFER,
    );
    let live = gpu.live_swapchains();

    gpu.surface(|s| s.modes.clear());
    assert!(!swapchain.reconstruct(FRAMEBUFFER, &[]));
    assert!(swapchain.out_of_date());
    assert!(swapchain.acquire_next_image(vk::Semaphore::null()).is_none());
    assert!(!swapchain.present(vk::Semaphore::null(), vk::Fence::null()));
    assert!(gpu.presented().is_empty());

    gpu.surface(|s| s.modes = vec![vk::PresentModeKHR::FIFO]);
    assert!(swapchain.reconstruct(FRAMEBUFFER, &[]));
    assert!(!swapchain.out_of_date());
    assert!(swapchain.acquire_next_image(vk::Semaphore::null()).is_some());
    assert!(swapchain.present(vk::Semaphore::null(), vk::Fence::null()));
    let presented = gpu.presented();
    assert_eq!(presented.len(), 1);
    assert!(!presented[0].0.is_null());
    assert_eq!(gpu.live_swapchains(), live + 1);
}

#[test]
fn rotation_sets_rotated_without_reconstruction() {
    let (gpu, _vram, mut swapchain) = setup();

    gpu.surface(|s| s.caps.current_transform = vk::SurfaceTransformFlagsKHR::ROTATE_90);
    assert!(swapchain.acquire_next_image(vk::Semaphore::null()).is_some());
    assert!(swapchain.rotated());
    assert!(!swapchain.out_of_date());
    assert_eq!(swapchain.display().transform, vk::SurfaceTransformFlagsKHR::ROTATE_90);

    gpu.surface(|s| s.caps.current_transform = vk::SurfaceTransformFlagsKHR::ROTATE_180);
    assert!(swapchain.present(vk::Semaphore::null(), vk::Fence::null()));
    assert!(!swapchain.rotated());
}

#[test]
fn retired_swapchain_is_released_through_deferred_queue() {
    let (gpu, vram, mut swapchain) = setup();
    let first = swapchain.handle();

    assert!(swapchain.reconstruct(FRAMEBUFFER, &[]));
    let created = gpu.created_swapchains();
    assert_eq!(created[1].old_swapchain, first);
    assert!(gpu.destroyed_swapchains().is_empty());
    assert_eq!(gpu.live_views(), 8);

    // Still usable while the old one is being retired
    assert!(swapchain.acquire_next_image(vk::Semaphore::null()).is_some());
    assert!(swapchain.present(vk::Semaphore::null(), vk::Fence::null()));

    vram.device().decrement_deferred();
    vram.device().decrement_deferred();
    assert_eq!(gpu.destroyed_swapchains(), vec![first]);
    assert_eq!(gpu.live_views(), 4);
    assert_eq!(vram.memory().counts().1, 1);
}

#[test]
fn acquire_waits_on_the_frames_drawn_fence() {
    let (gpu, _vram, mut swapchain) = setup();
    let fences: Vec<vk::Fence> = (0..3).map(|_| gpu.create_fence(true)).collect();

    for fence in &fences {
        assert!(swapchain.acquire_next_image(vk::Semaphore::null()).is_some());
        assert!(swapchain.present(vk::Semaphore::null(), *fence));
    }
    assert!(gpu.waited_fences().is_empty());

    // Image 0 comes round again
    assert!(swapchain.acquire_next_image(vk::Semaphore::null()).is_some());
    assert_eq!(swapchain.image_index(), 0);
    assert_eq!(gpu.waited_fences(), vec![fences[0]]);
}

#[test]
fn drop_destroys_everything() {
    let (gpu, vram, mut swapchain) = setup();
    assert!(swapchain.reconstruct(FRAMEBUFFER, &[]));

    drop(swapchain);
    assert_eq!(gpu.live_swapchains(), 0);
    assert_eq!(gpu.live_views(), 0);
    assert_eq!(vram.memory().counts().1, 0);
    assert!(gpu.destroyed_swapchains().iter().all(|s| s.as_raw() != 0));
}
