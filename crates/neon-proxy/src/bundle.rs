//! Deployable configuration bundles.
//!
//! A bundle is a gzip-compressed tar holding `config.txt` and, when any
//! certificate is referenced, `.certmanifest`. Headers are normalized
//! (mtime 0, mode 0644, uid/gid 0, no gzip timestamp) so identical content
//! always yields identical bytes.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::GzBuilder;
use flate2::read::GzDecoder;

use crate::error::{ProxyError, ProxyResult};
use crate::haproxy::RenderedConfig;

pub const CONFIG_ENTRY: &str = "config.txt";
pub const MANIFEST_ENTRY: &str = ".certmanifest";

/// Package a rendered config into bundle bytes.
pub fn build_bundle(rendered: &RenderedConfig) -> ProxyResult<Vec<u8>> {
    let mut entries = vec![(CONFIG_ENTRY, rendered.config.clone().into_bytes())];
    if !rendered.manifest.is_empty() {
        entries.push((MANIFEST_ENTRY, rendered.manifest_text().into_bytes()));
    }
    pack(&entries)
}

fn pack(entries: &[(&str, Vec<u8>)]) -> ProxyResult<Vec<u8>> {
    let encoder = GzBuilder::new()
        .mtime(0)
        .write(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.mode(tar::HeaderMode::Deterministic);

    for (path, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder
            .append_data(&mut header, path, data.as_slice())
            .map_err(|e| ProxyError::Bundle(format!("failed to append {path}: {e}")))?;
    }

    let mut encoder = builder
        .into_inner()
        .map_err(|e| ProxyError::Bundle(format!("failed to finish tar archive: {e}")))?;
    encoder
        .flush()
        .map_err(|e| ProxyError::Bundle(format!("failed to flush gzip stream: {e}")))?;
    encoder
        .finish()
        .map_err(|e| ProxyError::Bundle(format!("failed to finish gzip compression: {e}")))
}

/// Unpack a bundle into `(path, contents)` pairs in archive order.
pub fn read_bundle(bytes: &[u8]) -> ProxyResult<Vec<(String, Vec<u8>)>> {
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    let mut entries = Vec::new();
    let iter = archive
        .entries()
        .map_err(|e| ProxyError::Bundle(format!("unreadable bundle: {e}")))?;
    for entry in iter {
        let mut entry = entry.map_err(|e| ProxyError::Bundle(format!("bad entry: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| ProxyError::Bundle(format!("bad entry path: {e}")))?
            .to_string_lossy()
            .into_owned();
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(|e| ProxyError::Bundle(format!("failed to read {path}: {e}")))?;
        entries.push((path, data));
    }
    Ok(entries)
}
