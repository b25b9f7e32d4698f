// Texture - sampled 2D / cube images uploaded through VRAM
//
// Pixel data is RGBA8: raw bytes with an explicit size, or one (2D) / six
// (cube) compressed images decoded with the `image` crate. The upload runs
// on the transfer thread; the texture is usable once `ready()`.

use anyhow::{Context, Result};
use ash::vk;
use glam::UVec2;
use std::sync::Arc;

use super::future::Future;
use super::gpu::ViewDesc;
use super::memory::{ImageCreateInfo, ImageHandle, MemoryUsage};
use super::queue::QueueFlags;
use super::vram::Vram;

const CHANNELS: usize = 4;
const CUBE_FACES: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureKind {
    Flat,
    Cube,
}

#[derive(Debug, Clone)]
pub enum TextureData {
    /// Tightly packed RGBA8 pixels
    Raw { bytes: Vec<u8>, size: UVec2 },
    /// Encoded images (PNG, JPEG); six make a cube map
    Compressed(Vec<Vec<u8>>),
}

#[derive(Debug, Clone)]
pub struct TextureCreateInfo {
    pub data: TextureData,
    pub format: vk::Format,
}

impl TextureCreateInfo {
    pub fn new(data: TextureData) -> Self {
        Self { data, format: vk::Format::R8G8B8A8_SRGB }
    }
}

/// What a descriptor needs to bind the texture
#[derive(Debug, Clone, Copy)]
pub struct TextureInfo {
    pub image: ImageHandle,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub size: UVec2,
    pub kind: TextureKind,
}

struct Storage {
    info: TextureInfo,
    transfer: Future,
}

pub struct Texture {
    name: String,
    storage: Option<Storage>,
    vram: Arc<Vram>,
}

/// Decode to RGBA8, returning (size, layers)
fn decode(images: &[Vec<u8>]) -> Result<(UVec2, Vec<Vec<u8>>)> {
    let mut size: Option<UVec2> = None;
    let mut layers = Vec::with_capacity(images.len());
    for (i, bytes) in images.iter().enumerate() {
        let rgba = image::load_from_memory(bytes)
            .with_context(|| format!("Failed to decode image {}", i))?
            .to_rgba8();
        let dims = UVec2::new(rgba.width(), rgba.height());
        match size {
            Some(expected) if expected != dims => {
                anyhow::bail!(
                    "Cube face {} is {}x{}, expected {}x{}",
                    i,
                    dims.x,
                    dims.y,
                    expected.x,
                    expected.y
                )
            }
            _ => size = Some(dims),
        }
        layers.push(rgba.into_raw());
    }
    Ok((size.unwrap_or_default(), layers))
}

impl Texture {
    pub fn new(name: impl Into<String>, vram: Arc<Vram>) -> Self {
        Self { name: name.into(), storage: None, vram }
    }

    /// Replace any previous contents and start uploading `info`
    pub fn construct(&mut self, info: &TextureCreateInfo) -> Result<()> {
        self.destroy();

        let (size, layers) = match &info.data {
            TextureData::Raw { bytes, size } => {
                if bytes.is_empty() || size.x as usize * size.y as usize * CHANNELS != bytes.len() {
                    anyhow::bail!("Invalid raw image size/dimensions for [{}]", self.name);
                }
                (*size, vec![bytes.clone()])
            }
            TextureData::Compressed(images) => {
                if images.len() != 1 && images.len() != CUBE_FACES {
                    anyhow::bail!(
                        "[{}] needs 1 or {} images, got {}",
                        self.name,
                        CUBE_FACES,
                        images.len()
                    );
                }
                decode(images)?
            }
        };
        let kind = if layers.len() == CUBE_FACES { TextureKind::Cube } else { TextureKind::Flat };

        let memory = self.vram.memory();
        let image = memory.construct_image(&ImageCreateInfo {
            name: self.name.clone(),
            extent: vk::Extent3D { width: size.x, height: size.y, depth: 1 },
            format: info.format,
            usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            flags: match kind {
                TextureKind::Cube => vk::ImageCreateFlags::CUBE_COMPATIBLE,
                TextureKind::Flat => vk::ImageCreateFlags::empty(),
            },
            tiling: vk::ImageTiling::OPTIMAL,
            layers: layers.len() as u32,
            memory: MemoryUsage::GpuOnly,
            queue_flags: QueueFlags::TRANSFER | QueueFlags::GRAPHICS,
            share: vk::SharingMode::CONCURRENT,
        })?;

        let slices: Vec<&[u8]> = layers.iter().map(|l| l.as_slice()).collect();
        let transfer = self.vram.copy_image(
            &slices,
            image,
            (vk::ImageLayout::UNDEFINED, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
        );
        if !transfer.valid() {
            memory.destroy_image(image);
            anyhow::bail!("Failed to upload [{}]", self.name);
        }

        let raw = memory.image(image).context("Texture image vanished during construction")?;
        let view = self.vram.device().gpu().create_image_view(&ViewDesc {
            image: raw.image,
            format: info.format,
            aspect: vk::ImageAspectFlags::COLOR,
            view_type: match kind {
                TextureKind::Cube => vk::ImageViewType::CUBE,
                TextureKind::Flat => vk::ImageViewType::TYPE_2D,
            },
            layers: layers.len() as u32,
        });
        let view = match view {
            Ok(view) => view,
            Err(e) => {
                transfer.wait();
                memory.destroy_image(image);
                return Err(e);
            }
        };

        self.storage = Some(Storage {
            info: TextureInfo { image, view, format: info.format, size, kind },
            transfer,
        });
        Ok(())
    }

    /// Release the image and view through the deferred queue
    pub fn destroy(&mut self) {
        let Some(storage) = self.storage.take() else {
            return;
        };
        storage.transfer.wait();

        let device = self.vram.device();
        let gpu = device.gpu().clone();
        let view = storage.info.view;
        device.defer(move || gpu.destroy_image_view(view));
        self.vram.defer_image(storage.info.image, None);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn valid(&self) -> bool {
        self.storage.is_some()
    }

    pub fn busy(&self) -> bool {
        self.storage.as_ref().is_some_and(|s| s.transfer.busy())
    }

    pub fn ready(&self) -> bool {
        self.storage.as_ref().is_some_and(|s| s.transfer.ready())
    }

    /// Block until the upload finishes; true if it succeeded
    pub fn wait(&self) -> bool {
        self.storage.as_ref().is_some_and(|s| s.transfer.wait())
    }

    pub fn info(&self) -> Option<&TextureInfo> {
        self.storage.as_ref().map(|s| &s.info)
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        self.destroy();
    }
}
