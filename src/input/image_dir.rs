//! 图片目录回放源
//! Replays still images in file-name order, optionally paced to a frame rate

use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use super::{FramePoll, FrameSource};
use crate::error::{GateError, Result};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

pub struct ImageDirSource {
    dir: PathBuf,
    interval: Option<Duration>,
    files: Vec<PathBuf>,
    cursor: usize,
    next_due: Option<Instant>,
}

impl ImageDirSource {
    pub fn new(dir: PathBuf, interval: Option<Duration>) -> Self {
        Self {
            dir,
            interval,
            files: Vec::new(),
            cursor: 0,
            next_due: None,
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FrameSource for ImageDirSource {
    fn open(&mut self) -> Result<()> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| GateError::Capture(format!("{}: {}", self.dir.display(), e)))?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(GateError::Capture(format!(
                "{}: 目录中没有图片",
                self.dir.display()
            )));
        }
        info!("📂 图片源: {} ({} 帧)", self.dir.display(), files.len());

        self.files = files;
        self.cursor = 0;
        self.next_due = None;
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<FramePoll> {
        let Some(path) = self.files.get(self.cursor) else {
            return Ok(FramePoll::Ended);
        };

        // 按帧率节拍回放
        if let Some(interval) = self.interval {
            let now = Instant::now();
            let due = self.next_due.unwrap_or(now);
            if due > now {
                let wait = due - now;
                if wait > timeout {
                    thread::sleep(timeout);
                    return Ok(FramePoll::Pending);
                }
                thread::sleep(wait);
            }
            self.next_due = Some(due.max(now) + interval);
        }

        self.cursor += 1;
        match image::open(path) {
            Ok(img) => Ok(FramePoll::Frame(img.to_rgb8())),
            Err(e) => {
                warn!("⚠️ 跳过无法解码的图片 {}: {}", path.display(), e);
                Ok(FramePoll::Pending)
            }
        }
    }

    fn close(&mut self) {
        self.files.clear();
        self.cursor = 0;
    }

    fn describe(&self) -> String {
        format!("图片目录 {}", self.dir.display())
    }
}
