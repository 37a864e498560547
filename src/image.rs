use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::AsyncWriteExt;

use crate::arch::GuestArch;
use crate::backend::MachineSpec;
use crate::error::MkvmError;
use crate::util::{format_size, parse_size};
use crate::{logging, paths};

fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

fn join_url(base: &str, rest: &str) -> String {
    if base.ends_with('/') {
        format!("{base}{rest}")
    } else {
        format!("{base}/{rest}")
    }
}

/// Make sure `<workdir>/disk.img` exists and return its path.
///
/// An existing disk is booted as-is, so a persisted image picks up where
/// the previous run left it.
pub async fn prepare_disk(
    spec: &MachineSpec,
    guest: &GuestArch,
    cache_dir: &Path,
) -> Result<PathBuf, MkvmError> {
    let disk = paths::disk_path(&spec.workdir);
    if disk.exists() {
        tracing::info!(path = %disk.display(), "reusing existing disk");
        return Ok(disk);
    }

    let size = parse_size(&spec.disk_size)?;
    let source = if is_url(&spec.image_source) {
        let url = resolve_image_url(&spec.image_source, guest).await?;
        ensure_cached_image(&url, cache_dir).await?
    } else {
        let path = PathBuf::from(&spec.image_source);
        if !path.is_file() {
            return Err(MkvmError::Io {
                context: format!("image not found: {}", path.display()),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
            });
        }
        path
    };

    let image_size = install_disk(&source, &disk, size).await?;
    if let Some(note) = root_growth_note(guest, image_size, size) {
        tracing::warn!("{note}");
    }
    Ok(disk)
}

/// Warn when the disk was enlarged for an image that won't use the space.
fn root_growth_note(guest: &GuestArch, image_size: u64, disk_size: u64) -> Option<String> {
    (disk_size > image_size && !guest.grows_root).then(|| {
        format!(
            "{} images keep their {} root; the remaining {} of the disk stays unpartitioned",
            guest.name,
            format_size(image_size),
            format_size(disk_size - image_size)
        )
    })
}

/// Find the bootable image for `guest` under a daily build base URL.
pub async fn resolve_image_url(base: &str, guest: &GuestArch) -> Result<String, MkvmError> {
    let listing_url = join_url(base, guest.image_dir);
    tracing::info!(url = %listing_url, "looking up image");

    let response = reqwest::get(&listing_url)
        .await
        .map_err(|e| MkvmError::ImageDownload {
            message: format!("request to {listing_url} failed"),
            source: Box::new(e),
        })?;
    if !response.status().is_success() {
        return Err(MkvmError::ImageDownload {
            message: format!("HTTP {} from {listing_url}", response.status()),
            source: format!("HTTP {}", response.status()).into(),
        });
    }
    let html = response.text().await.map_err(|e| MkvmError::ImageDownload {
        message: format!("reading {listing_url}"),
        source: Box::new(e),
    })?;

    let name = find_image_link(&html, guest.image_suffix).ok_or_else(|| MkvmError::ImageDownload {
        message: format!("no *{} image listed at {listing_url}", guest.image_suffix),
        source: "image not in directory listing".into(),
    })?;
    Ok(join_url(&listing_url, &name))
}

/// First file name in an HTML directory listing ending in `suffix`.
pub fn find_image_link(html: &str, suffix: &str) -> Option<String> {
    html.split("href=\"").skip(1).find_map(|rest| {
        let target = rest.split('"').next()?;
        let target = target.split(['?', '#']).next()?;
        let name = target.rsplit('/').next()?;
        (name.ends_with(suffix) && !name.is_empty()).then(|| name.to_string())
    })
}

/// Download a response body to a file, updating the progress bar as chunks arrive.
async fn download_to_file(
    path: &Path,
    response: reqwest::Response,
    pb: &ProgressBar,
) -> Result<(), MkvmError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| MkvmError::Io {
            context: format!("creating temp file {}", path.display()),
            source: e,
        })?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| MkvmError::ImageDownload {
            message: "error reading response body".into(),
            source: Box::new(e),
        })?;
        file.write_all(&chunk).await.map_err(|e| MkvmError::Io {
            context: "writing image data".into(),
            source: e,
        })?;
        pb.inc(chunk.len() as u64);
    }

    file.flush().await.map_err(|e| MkvmError::Io {
        context: "flushing image file".into(),
        source: e,
    })?;

    Ok(())
}

/// Download `url` into the cache unless it is already there.
pub async fn ensure_cached_image(url: &str, cache_dir: &Path) -> Result<PathBuf, MkvmError> {
    let filename = url.rsplit('/').next().unwrap_or("image.img.gz");

    tokio::fs::create_dir_all(cache_dir)
        .await
        .map_err(|e| MkvmError::Io {
            context: format!("creating cache dir {}", cache_dir.display()),
            source: e,
        })?;

    let dest = cache_dir.join(filename);
    if dest.exists() {
        tracing::info!(path = %dest.display(), "using cached image");
        return Ok(dest);
    }

    tracing::info!(url, "downloading image");

    let response = reqwest::get(url)
        .await
        .map_err(|e| MkvmError::ImageDownload {
            message: format!("request to {url} failed"),
            source: Box::new(e),
        })?;

    if !response.status().is_success() {
        return Err(MkvmError::ImageDownload {
            message: format!("HTTP {} from {url}", response.status()),
            source: format!("HTTP {}", response.status()).into(),
        });
    }

    let pb = ProgressBar::new(response.content_length().unwrap_or(0));
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .expect("valid progress template")
            .progress_chars("#>-"),
    );

    let tmp_path = dest.with_extension("part");
    let _ = tokio::fs::remove_file(&tmp_path).await;

    if let Err(e) = download_to_file(&tmp_path, response, &pb).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }

    tokio::fs::rename(&tmp_path, &dest)
        .await
        .map_err(|e| MkvmError::Io {
            context: format!("renaming {} to {}", tmp_path.display(), dest.display()),
            source: e,
        })?;

    pb.finish_and_clear();
    tracing::info!(path = %dest.display(), "image cached");

    Ok(dest)
}

/// Write `source` (gzip or raw) to `disk` and grow it to `size` bytes.
///
/// Returns the size of the unpacked image.
pub async fn install_disk(source: &Path, disk: &Path, size: u64) -> Result<u64, MkvmError> {
    if let Some(parent) = disk.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| MkvmError::Io {
                context: format!("creating directory {}", parent.display()),
                source: e,
            })?;
    }

    let source = source.to_path_buf();
    let disk = disk.to_path_buf();
    tokio::task::spawn_blocking(move || write_disk(&source, &disk, size))
        .await
        .map_err(|e| MkvmError::Io {
            context: "disk writer task failed".into(),
            source: std::io::Error::other(e),
        })?
}

fn write_disk(source: &Path, disk: &Path, size: u64) -> Result<u64, MkvmError> {
    let tmp = disk.with_extension("part");
    let io = |context: String| move |e: std::io::Error| MkvmError::Io { context, source: e };

    let input = std::fs::File::open(source).map_err(io(format!("opening {}", source.display())))?;
    let mut reader: Box<dyn Read> = if source.extension().is_some_and(|e| e == "gz") {
        Box::new(flate2::read::GzDecoder::new(input))
    } else {
        Box::new(input)
    };

    let mut out = std::fs::File::create(&tmp).map_err(io(format!("creating {}", tmp.display())))?;
    let written = std::io::copy(&mut reader, &mut out)
        .map_err(io(format!("writing {} from {}", tmp.display(), source.display())))?;
    if written < size {
        out.set_len(size).map_err(io(format!("resizing {}", tmp.display())))?;
    }
    out.sync_all().map_err(io(format!("syncing {}", tmp.display())))?;
    drop(out);

    std::fs::rename(&tmp, disk)
        .map_err(io(format!("renaming {} to {}", tmp.display(), disk.display())))?;
    tracing::info!(
        path = %disk.display(),
        image = %format_size(written),
        disk = %format_size(written.max(size)),
        "disk image ready"
    );
    Ok(written)
}

// ── cache management ──────────────────────────────────────

fn cached_files(cache_dir: &Path) -> Result<Vec<std::fs::DirEntry>, MkvmError> {
    let mut entries: Vec<_> = std::fs::read_dir(cache_dir)
        .map_err(|e| MkvmError::Io {
            context: format!("reading cache directory {}", cache_dir.display()),
            source: e,
        })?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .collect();
    entries.sort_by_key(|e| e.file_name());
    Ok(entries)
}

/// List cached images with size and modification time.
pub fn list_cached(cache_dir: &Path) -> Result<(), MkvmError> {
    if !cache_dir.exists() {
        println!("No cached images.");
        return Ok(());
    }

    let entries = cached_files(cache_dir)?;
    if entries.is_empty() {
        println!("No cached images.");
        return Ok(());
    }

    let mut total_size: u64 = 0;
    for entry in &entries {
        let meta = entry.metadata().map_err(|e| MkvmError::Io {
            context: format!("reading metadata for {}", entry.path().display()),
            source: e,
        })?;
        total_size += meta.len();
        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|d| logging::format_timestamp(d.as_secs()))
            .unwrap_or_else(|| "unknown".into());
        println!(
            "  {}  {}  {}",
            entry.file_name().to_string_lossy(),
            format_size(meta.len()),
            modified
        );
    }
    println!("\n{} image(s), {} total", entries.len(), format_size(total_size));

    Ok(())
}

/// Delete one cached image by file name.
pub fn delete_cached(cache_dir: &Path, name: &str) -> Result<(), MkvmError> {
    if name.contains('/') {
        return Err(MkvmError::Validation {
            message: format!("'{name}' is not a cached image name"),
        });
    }
    let path = cache_dir.join(name);
    let meta = std::fs::metadata(&path).map_err(|e| MkvmError::Io {
        context: format!("cached image '{name}' not found in {}", cache_dir.display()),
        source: e,
    })?;
    std::fs::remove_file(&path).map_err(|e| MkvmError::Io {
        context: format!("deleting {}", path.display()),
        source: e,
    })?;
    println!("Deleted '{}' ({})", name, format_size(meta.len()));
    Ok(())
}

/// Delete every cached image.
pub fn clear_cache(cache_dir: &Path) -> Result<(), MkvmError> {
    if !cache_dir.exists() {
        println!("No cached images.");
        return Ok(());
    }

    let entries = cached_files(cache_dir)?;
    if entries.is_empty() {
        println!("No cached images.");
        return Ok(());
    }

    let total_size: u64 = entries
        .iter()
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum();

    for entry in &entries {
        std::fs::remove_file(entry.path()).map_err(|e| MkvmError::Io {
            context: format!("deleting {}", entry.path().display()),
            source: e,
        })?;
    }
    println!(
        "Deleted {} image(s) ({})",
        entries.len(),
        format_size(total_size)
    );
    Ok(())
}
