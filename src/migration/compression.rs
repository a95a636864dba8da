// ABOUTME: Gzip compression of exported batches
// ABOUTME: Runs the codec on the blocking pool so workers keep the runtime responsive

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 4), Compression::default());
    encoder.write_all(data).context("Failed to compress batch")?;
    encoder.finish().context("Failed to finish gzip stream")
}

fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .context("Batch file is not a valid gzip stream")?;
    Ok(out)
}

pub async fn gzip(data: Vec<u8>) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || compress(&data))
        .await
        .context("Compression task panicked")?
}

pub async fn gunzip(data: Vec<u8>) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || decompress(&data))
        .await
        .context("Decompression task panicked")?
}
