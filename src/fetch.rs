//! モデルファイルの取得とキャッシュ
//!
//! ローカルに無いファイルだけをHTTPで取得します。ダウンロード中は
//! `<name>.part` に書き込み、完了後にリネームするため、途中で中断しても
//! 壊れたファイルが「取得済み」と見なされることはありません。

use anyhow::{Context, Result};
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

const MB: u64 = 1024 * 1024;

/// サイズ不明時の進捗出力間隔
const UNKNOWN_SIZE_REPORT_BYTES: u64 = 10 * MB;

/// ダウンロード進捗
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    downloaded: u64,
    total: Option<u64>,
    started: Instant,
    last_bucket: u64,
}

impl DownloadProgress {
    pub fn new(total: Option<u64>) -> Self {
        Self {
            downloaded: 0,
            total: total.filter(|t| *t > 0),
            started: Instant::now(),
            last_bucket: 0,
        }
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    /// 受信バイト数を加算し、ログを出すべき区切りを越えたらtrue
    pub fn advance(&mut self, bytes: u64) -> bool {
        self.downloaded += bytes;
        let bucket = self.bucket();
        if bucket > self.last_bucket {
            self.last_bucket = bucket;
            true
        } else {
            false
        }
    }

    // 10%ごと（サイズ不明なら10MBごと）の区切り番号
    fn bucket(&self) -> u64 {
        match self.percent() {
            Some(percent) => percent / 10,
            None => self.downloaded / UNKNOWN_SIZE_REPORT_BYTES,
        }
    }

    pub fn percent(&self) -> Option<u64> {
        self.total
            .map(|total| (self.downloaded.saturating_mul(100) / total).min(100))
    }

    /// 経過時間を指定して進捗行を作成
    pub fn summary_at(&self, elapsed: Duration) -> String {
        let secs = elapsed.as_secs_f64();
        let speed_kb = if secs > 0.0 {
            (self.downloaded as f64 / 1024.0 / secs) as u64
        } else {
            0
        };
        let mb = self.downloaded / MB;
        match self.percent() {
            Some(percent) => format!(
                "...{}%, {} MB, {} KB/s, {} seconds passed",
                percent,
                mb,
                speed_kb,
                elapsed.as_secs()
            ),
            None => format!(
                "...{} MB, {} KB/s, {} seconds passed",
                mb,
                speed_kb,
                elapsed.as_secs()
            ),
        }
    }

    pub fn summary(&self) -> String {
        self.summary_at(self.started.elapsed())
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

/// `base_url` と `name` を `/` で連結
pub fn join_url(base_url: &str, name: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), name.trim_start_matches('/'))
}

/// レスポンス本体を `part` に書き出す
async fn write_body(
    response: &mut reqwest::Response,
    part: &Path,
    progress: &mut DownloadProgress,
) -> Result<()> {
    let mut file = tokio::fs::File::create(part)
        .await
        .with_context(|| format!("Failed to create {:?}", part))?;

    while let Some(chunk) = response
        .chunk()
        .await
        .context("Failed while reading response body")?
    {
        file.write_all(&chunk)
            .await
            .with_context(|| format!("Failed to write {:?}", part))?;
        if progress.advance(chunk.len() as u64) {
            info!("{}", progress.summary());
        }
    }

    file.flush().await?;
    Ok(())
}

/// HTTP経由でモデルファイルを取得する
#[derive(Debug, Clone, Default)]
pub struct Fetcher {
    client: Client,
}

impl Fetcher {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    /// `url` を `dest` にダウンロードし、受信バイト数を返す
    pub async fn download_file(&self, url: &str, dest: &Path) -> Result<u64> {
        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create directory: {:?}", parent))?;
            }
        }

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to request {}", url))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("download of {} returned HTTP {}", url, status);
        }

        let part = part_path(dest);
        let mut progress = DownloadProgress::new(response.content_length());
        debug!("ダウンロード開始: {} -> {}", url, dest.display());

        // 途中で失敗した場合は書きかけのファイルを残さない
        if let Err(e) = write_body(&mut response, &part, &mut progress).await {
            tokio::fs::remove_file(&part).await.ok();
            return Err(e.context(format!("download of {} failed", url)));
        }

        tokio::fs::rename(&part, dest)
            .await
            .with_context(|| format!("Failed to move {:?} to {:?}", part, dest))?;

        info!(
            "ダウンロード完了: {} ({})",
            dest.display(),
            progress.summary()
        );
        Ok(progress.downloaded())
    }

    /// `dest` が無ければダウンロードする。ダウンロードした場合はtrue
    pub async fn ensure_file(&self, url: &str, dest: &Path) -> Result<bool> {
        if dest.is_file() {
            info!("モデルファイルは取得済みです: {}", dest.display());
            return Ok(false);
        }

        info!("モデルファイルが見つかりません。ダウンロードを開始します: {}", url);
        self.download_file(url, dest).await?;
        Ok(true)
    }

    /// 同名ファイル群をサーバのフォルダから取得（ローカルに無いものだけ）
    ///
    /// ダウンロードしたファイル数を返します。
    pub async fn ensure_files_from_server(
        &self,
        base_url: &str,
        local_dir: &Path,
        names: &[&str],
    ) -> Result<usize> {
        let mut downloaded = 0;
        for name in names {
            let dest = local_dir.join(name);
            if self.ensure_file(&join_url(base_url, name), &dest).await? {
                downloaded += 1;
            }
        }
        Ok(downloaded)
    }

    /// `marker` が無ければtar.gzを取得して `dest_dir` に展開する
    ///
    /// 展開後に `marker` が存在しない場合はエラーです。
    pub async fn ensure_archive(&self, url: &str, dest_dir: &Path, marker: &Path) -> Result<bool> {
        if marker.exists() {
            return Ok(false);
        }

        let archive_path = dest_dir.join("download.tar.gz");
        self.download_file(url, &archive_path).await?;

        let unpack_dir = dest_dir.to_path_buf();
        let unpack_archive = archive_path.clone();
        let unpacked = tokio::task::spawn_blocking(move || unpack_tar_gz(&unpack_archive, &unpack_dir))
            .await
            .context("unpack task panicked");

        tokio::fs::remove_file(&archive_path).await.ok();
        unpacked??;

        if !marker.exists() {
            anyhow::bail!(
                "archive from {} did not contain expected file {:?}",
                url,
                marker
            );
        }
        Ok(true)
    }
}

/// tar.gzを展開
pub fn unpack_tar_gz(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    let file = std::fs::File::open(archive_path)
        .with_context(|| format!("Failed to open archive: {:?}", archive_path))?;
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
    archive
        .unpack(dest_dir)
        .with_context(|| format!("Failed to unpack {:?} into {:?}", archive_path, dest_dir))?;
    info!("展開しました: {}", dest_dir.display());
    Ok(())
}
