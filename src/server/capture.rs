//! Capture bundles: screen metadata plus an optional encoded screenshot,
//! packed into one zip archive.

use std::io::{Cursor, Write};

use anyhow::{Context, Result};
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::capability::Capabilities;
use crate::transport::{CaptureInfo, CaptureOptions};

pub const INFO_ENTRY: &str = "info";
pub const IMAGE_ENTRY: &str = "image";

/// Gather screen metadata. Node dump and window lookups degrade to empty
/// values.
pub fn capture_info(caps: &Capabilities, options: &CaptureOptions) -> CaptureInfo {
    let device = &caps.device;
    let (screen_width, screen_height) = device.display_size();
    let (image_width, image_height) = options.target_size(screen_width, screen_height);

    let nodes = device.nodes().unwrap_or_else(|e| {
        warn!(error = %e, "Node dump failed");
        serde_json::Value::Array(Vec::new())
    });
    let active_window = device.active_window().unwrap_or_else(|e| {
        warn!(error = %e, "Active window lookup failed");
        String::new()
    });

    CaptureInfo {
        rotation: device.rotation(),
        screen_width,
        screen_height,
        image_width,
        image_height,
        nodes,
        active_window,
    }
}

/// Build the bundle for `options`. Only archive errors are reported;
/// a failed screenshot just leaves out the `image` entry.
pub fn capture_bundle(caps: &Capabilities, options: &CaptureOptions) -> Result<Vec<u8>> {
    let info = capture_info(caps, options);
    let image = match caps.screen.capture(
        info.rotation,
        info.image_width,
        info.image_height,
        options.clamped_quality(),
    ) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            debug!(error = %e, "Screenshot unavailable, sending info only");
            None
        }
    };

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let entry_options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    zip.start_file(INFO_ENTRY, entry_options)?;
    zip.write_all(&serde_json::to_vec(&info)?)?;

    if let Some(image) = image {
        // Already compressed.
        zip.start_file(IMAGE_ENTRY, entry_options.compression_method(CompressionMethod::Stored))?;
        zip.write_all(&image)?;
    }

    let cursor = zip.finish().context("Failed to finish capture archive")?;
    Ok(cursor.into_inner())
}
