//! Media source reader: turns a stored video into a lazy stream of
//! grayscale frames by piping raw `gray` pixels out of `ffmpeg`.

use std::collections::VecDeque;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;

use image::GrayImage;
use thiserror::Error;

/// One decoded frame, owned by whoever is processing the video.
#[derive(Debug, Clone)]
pub struct Frame {
    pub index: usize,
    pub image: GrayImage,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("cannot open {path}: {reason}")]
    Open { path: PathBuf, reason: String },
    #[error("{path} contains no decodable frames")]
    NoFrames { path: PathBuf },
    #[error("{path}: truncated frame {index} ({got} of {expected} bytes)")]
    Truncated {
        path: PathBuf,
        index: usize,
        got: usize,
        expected: usize,
    },
    #[error("{path}: decoder failed after {frames} frames: {reason}")]
    Stream {
        path: PathBuf,
        frames: usize,
        reason: String,
    },
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Largest frame edge accepted from `ffprobe`.
const MAX_DIMENSION: u32 = 16384;

/// Bytes of ffmpeg's stderr kept for error reports.
const STDERR_TAIL: usize = 4096;

/// Finite, single-pass frame stream in temporal order.
pub type Frames = Box<dyn Iterator<Item = Result<Frame, DecodeError>> + Send>;

/// Anything that can open a stored video as a frame stream.
///
/// Implementations must fail at open time when the media yields no frames.
pub trait FrameSource: Send + Sync {
    fn open(&self, path: &Path) -> Result<Frames, DecodeError>;
}

/// Decoder backed by the `ffmpeg` / `ffprobe` command line tools.
#[derive(Debug, Clone)]
pub struct FfmpegSource {
    pub ffmpeg: String,
    pub ffprobe: String,
    /// Keep every `frame_step`-th frame; 1 keeps all of them.
    pub frame_step: usize,
}

impl Default for FfmpegSource {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
            frame_step: 1,
        }
    }
}

impl FfmpegSource {
    fn probe_dimensions(&self, path: &Path) -> Result<(u32, u32), DecodeError> {
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=width,height",
                "-of",
                "csv=p=0:s=x",
            ])
            .arg(path)
            .output()
            .map_err(|e| DecodeError::Open {
                path: path.to_path_buf(),
                reason: format!("running {}: {}", self.ffprobe, e),
            })?;

        if !output.status.success() {
            return Err(DecodeError::Open {
                path: path.to_path_buf(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        parse_dimensions(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            DecodeError::Open {
                path: path.to_path_buf(),
                reason: "no video stream".to_string(),
            }
        })
    }
}

impl FrameSource for FfmpegSource {
    fn open(&self, path: &Path) -> Result<Frames, DecodeError> {
        if !path.is_file() {
            return Err(DecodeError::Open {
                path: path.to_path_buf(),
                reason: "file not found".to_string(),
            });
        }

        let (width, height) = self.probe_dimensions(path)?;
        log::debug!(
            "decoding {}: {}x{} step={}",
            path.display(),
            width,
            height,
            self.frame_step
        );

        let mut child = Command::new(&self.ffmpeg)
            .args(["-v", "error", "-nostdin", "-i"])
            .arg(path)
            .args(["-f", "rawvideo", "-pix_fmt", "gray", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DecodeError::Open {
                path: path.to_path_buf(),
                reason: format!("running {}: {}", self.ffmpeg, e),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| DecodeError::Open {
            path: path.to_path_buf(),
            reason: "ffmpeg stdout unavailable".to_string(),
        })?;

        // Drained concurrently: a chatty decoder must never block on a full
        // stderr pipe while we wait on stdout.
        let stderr = child.stderr.take().map(drain_tail);

        let mut reader = RawGrayReader {
            path: path.to_path_buf(),
            child: Some(child),
            stdout,
            stderr,
            width,
            height,
            step: self.frame_step.max(1),
            next_index: 0,
            finished: false,
        };

        // Pull the first frame now so empty media fails here, not mid-run.
        let first = match reader.next() {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => return Err(e),
            None => {
                return Err(DecodeError::NoFrames {
                    path: path.to_path_buf(),
                })
            }
        };

        Ok(Box::new(std::iter::once(Ok(first)).chain(reader)))
    }
}

struct RawGrayReader {
    path: PathBuf,
    child: Option<Child>,
    stdout: ChildStdout,
    stderr: Option<JoinHandle<String>>,
    width: u32,
    height: u32,
    step: usize,
    next_index: usize,
    finished: bool,
}

impl RawGrayReader {
    fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Read one raw frame. `Ok(None)` means a clean end of stream.
    fn read_raw(&mut self) -> Result<Option<Vec<u8>>, DecodeError> {
        let expected = self.frame_len();
        let mut buf = vec![0u8; expected];
        let got = read_full(&mut self.stdout, &mut buf).map_err(|source| DecodeError::Io {
            path: self.path.clone(),
            source,
        })?;
        if got == 0 {
            return Ok(None);
        }
        if got < expected {
            return Err(DecodeError::Truncated {
                path: self.path.clone(),
                index: self.next_index,
                got,
                expected,
            });
        }
        Ok(Some(buf))
    }

    fn finish(&mut self) -> Result<(), DecodeError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child.wait().map_err(|source| DecodeError::Io {
            path: self.path.clone(),
            source,
        })?;
        let stderr = self
            .stderr
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        if status.success() {
            return Ok(());
        }
        Err(DecodeError::Stream {
            path: self.path.clone(),
            frames: self.next_index,
            reason: if stderr.trim().is_empty() {
                format!("ffmpeg exited with {}", status)
            } else {
                stderr.trim().to_string()
            },
        })
    }
}

impl Iterator for RawGrayReader {
    type Item = Result<Frame, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            let raw = match self.read_raw() {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    self.finished = true;
                    return self.finish().err().map(Err);
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            };

            let index = self.next_index;
            self.next_index += 1;
            if index % self.step != 0 {
                continue;
            }

            return match GrayImage::from_raw(self.width, self.height, raw) {
                Some(image) => Some(Ok(Frame { index, image })),
                None => {
                    self.finished = true;
                    Some(Err(DecodeError::Truncated {
                        path: self.path.clone(),
                        index,
                        got: 0,
                        expected: self.frame_len(),
                    }))
                }
            };
        }
    }
}

impl Drop for RawGrayReader {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        // The stderr thread exits on its own once the pipe closes.
    }
}

/// Read `stderr` to EOF on its own thread, keeping only the last
/// `STDERR_TAIL` bytes.
fn drain_tail(mut stderr: ChildStderr) -> JoinHandle<String> {
    std::thread::spawn(move || {
        let mut tail: VecDeque<u8> = VecDeque::with_capacity(STDERR_TAIL);
        let mut buf = [0u8; 4096];
        loop {
            match stderr.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    tail.extend(&buf[..n]);
                    let excess = tail.len().saturating_sub(STDERR_TAIL);
                    tail.drain(..excess);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        String::from_utf8_lossy(tail.make_contiguous()).into_owned()
    })
}

/// Like `read_exact`, but reports how many bytes arrived before EOF.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn parse_dimensions(probe: &str) -> Option<(u32, u32)> {
    let line = probe.lines().map(str::trim).find(|l| !l.is_empty())?;
    let (w, h) = line.split_once('x')?;
    let width: u32 = w.trim().parse().ok()?;
    let height: u32 = h.trim().trim_end_matches(',').parse().ok()?;
    if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
        return None;
    }
    Some((width, height))
}
