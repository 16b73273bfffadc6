//! Extracting an image to a directory.
//!
//! This applies the directory tree and the unnamed data streams, verifying
//! every blob against its recorded SHA-1 on the way out. Named streams,
//! security descriptors and timestamps are platform concerns the portable
//! core does not apply; the data and shape of the tree are what is
//! reproduced.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{ErrorInner, IoOp, IoResultExt, Result};
use crate::metadata::{Dentry, StreamRef};
use crate::progress::{Progress, ProgressFn};
use crate::wim::fire;
use crate::Wim;

#[derive(Debug)]
struct ExtractOp {
    rel_path: PathBuf,
    display: String,
    is_dir: bool,
    stream: StreamRef,
}

impl Wim {
    /// Extract image `image` (1-based) into the directory `target`,
    /// creating it if needed.
    pub fn extract_image(&mut self, image: u32, target: impl AsRef<Path>) -> Result<()> {
        let target = target.as_ref();
        let mut progress = self.progress.take();
        let result = self.extract_image_inner(image, target, &mut progress);
        self.progress = progress;
        result
    }

    fn extract_image_inner(
        &mut self,
        image: u32,
        target: &Path,
        progress: &mut Option<Box<ProgressFn>>,
    ) -> Result<()> {
        fire(progress, &Progress::ExtractImageBegin { image, target })?;

        // Collect the plan first; streaming blobs below needs `&mut self`.
        let mut ops = Vec::new();
        let mut total_bytes = 0u64;
        {
            let img = self.image(image)?;
            collect_ops(&img.root, PathBuf::new(), String::new(), &mut ops);
            for op in &ops {
                if let StreamRef::Hash(h) = op.stream {
                    total_bytes += self.blob_table.get(&h).map_or(0, |b| b.size);
                }
            }
        }

        fs::create_dir_all(target).io_ctx(IoOp::Mkdir)?;

        let mut completed_bytes = 0u64;
        for op in &ops {
            fire(progress, &Progress::ExtractDentry { path: &op.display })?;
            let dest = target.join(&op.rel_path);
            if op.is_dir {
                fs::create_dir_all(&dest).io_ctx(IoOp::Mkdir)?;
                continue;
            }

            let mut out = fs::File::create(&dest).io_ctx(IoOp::Open)?;
            match op.stream {
                StreamRef::Empty => {}
                StreamRef::Hash(hash) => {
                    self.read_blob_with(&hash, &mut |chunk| {
                        out.write_all(chunk).io_ctx(IoOp::Write)
                    })?;
                    completed_bytes += self.blob_table.get(&hash).map_or(0, |b| b.size);
                    fire(
                        progress,
                        &Progress::ExtractStreams {
                            total_bytes,
                            completed_bytes,
                        },
                    )?;
                }
                StreamRef::Unhashed(id) => {
                    // An image not yet written still references scanner
                    // data directly.
                    let u = self
                        .blob_table
                        .unhashed(id)
                        .ok_or(ErrorInner::InvalidParam("dangling unhashed blob"))?
                        .clone();
                    let source = crate::write::BlobReadSource::from_location(&u.location, u.size);
                    crate::write::stream_blob(self, &source, &mut |chunk| {
                        out.write_all(chunk).io_ctx(IoOp::Write)
                    })?;
                }
            }
        }

        fire(progress, &Progress::ExtractTimestamps)?;
        fire(progress, &Progress::ExtractImageEnd { image })?;
        Ok(())
    }
}

fn collect_ops(dentry: &Dentry, rel: PathBuf, display: String, ops: &mut Vec<ExtractOp>) {
    for child in &dentry.children {
        let rel_path = rel.join(&child.name);
        let display_path = format!("{display}/{}", child.name);
        ops.push(ExtractOp {
            rel_path: rel_path.clone(),
            display: display_path.clone(),
            is_dir: child.is_directory(),
            stream: child.unnamed_stream,
        });
        if child.is_directory() {
            collect_ops(child, rel_path, display_path, ops);
        }
    }
}
