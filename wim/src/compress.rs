//! The chunk compressor: the write path's only source of CPU parallelism.
//!
//! The orchestrator fills one chunk buffer at a time and submits it; the
//! pipeline hands back `(uncompressed, Option<compressed>)` results in
//! submission order, regardless of worker completion order. The parallel
//! variant runs a small worker pool over a pair of bounded channels and a
//! completion ring; backpressure comes from blocking on the bottleneck
//! chunk when the ring is full.

use std::num::NonZeroUsize;
use std::panic;
use std::thread;

use crossbeam_channel as mpmc;

use crate::header::CompressionType;

/// One compressed (or incompressible) chunk.
#[derive(Debug)]
pub(crate) struct ChunkResult {
    pub uncompressed: Vec<u8>,
    /// `None` when compression would not have shrunk the chunk; the caller
    /// stores the raw bytes instead.
    pub compressed: Option<Vec<u8>>,
}

type Task = (usize, Vec<u8>);
type TaskDone = (usize, ChunkResult);

pub(crate) enum ChunkPipeline {
    Serial(SerialPipeline),
    Parallel(ParallelPipeline),
}

impl std::fmt::Debug for ChunkPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChunkPipeline::Serial(_) => f.pad("ChunkPipeline::Serial"),
            ChunkPipeline::Parallel(p) => f
                .debug_struct("ChunkPipeline::Parallel")
                .field("threads", &p.threads.len())
                .finish(),
        }
    }
}

impl ChunkPipeline {
    /// Build a pipeline for `num_threads` workers (0 means "pick one
    /// thread per available CPU"). Compression type `None` still flows
    /// through the serial pipeline, producing raw chunks.
    pub fn new(ctype: CompressionType, chunk_size: u32, num_threads: u32) -> std::io::Result<Self> {
        let format = ctype.codec_format();
        let threads = match num_threads {
            0 => thread::available_parallelism().map_or(1, NonZeroUsize::get),
            n => n as usize,
        };
        if threads <= 1 || format.is_none() {
            let compressor = format.map(|f| {
                wim_codecs::Compressor::new(f, chunk_size).expect("chunk size validated earlier")
            });
            return Ok(ChunkPipeline::Serial(SerialPipeline { compressor }));
        }
        Ok(ChunkPipeline::Parallel(ParallelPipeline::new(
            format.expect("checked above"),
            chunk_size,
            threads,
        )?))
    }

    /// Submit one filled chunk buffer; completed results (in submission
    /// order) are appended to `done`.
    pub fn submit(&mut self, chunk: Vec<u8>, done: &mut Vec<ChunkResult>) {
        match self {
            ChunkPipeline::Serial(s) => {
                let compressed = s.compressor.as_mut().and_then(|c| c.compress(&chunk));
                done.push(ChunkResult {
                    uncompressed: chunk,
                    compressed,
                });
            }
            ChunkPipeline::Parallel(p) => p.submit(chunk, done),
        }
    }

    /// Wait for every in-flight chunk. The pipeline stays usable for the
    /// next resource.
    pub fn drain(&mut self, done: &mut Vec<ChunkResult>) {
        match self {
            ChunkPipeline::Serial(_) => {}
            ChunkPipeline::Parallel(p) => p.drain(done),
        }
    }
}

pub(crate) struct SerialPipeline {
    compressor: Option<wim_codecs::Compressor>,
}

pub(crate) struct ParallelPipeline {
    injector: Option<mpmc::Sender<Task>>,
    collector: mpmc::Receiver<TaskDone>,
    next_to_send: usize,
    next_to_recv: usize,
    ring: Box<[Option<ChunkResult>]>,
    in_flight: usize,
    threads: Box<[thread::JoinHandle<()>]>,
}

impl Drop for ParallelPipeline {
    fn drop(&mut self) {
        self.injector = None;
        let worker_panicked = std::mem::take(&mut self.threads)
            .into_vec()
            .into_iter()
            .fold(false, |panicked, j| panicked | j.join().is_err());
        if worker_panicked && !thread::panicking() {
            panic!("compressor worker panicked");
        }
    }
}

impl ParallelPipeline {
    fn new(format: wim_codecs::Format, chunk_size: u32, thread_cnt: usize) -> std::io::Result<Self> {
        let max_inflights = thread_cnt + thread_cnt.div_ceil(2);

        let (injector, injector_rx) = mpmc::bounded::<Task>(max_inflights);
        let (collector_tx, collector) = mpmc::bounded::<TaskDone>(max_inflights);

        let threads = (0..thread_cnt)
            .map(|idx| {
                let injector_rx = injector_rx.clone();
                let collector_tx = collector_tx.clone();
                thread::Builder::new()
                    .name(format!("wim-compress-{idx}"))
                    .spawn(move || Self::worker(format, chunk_size, injector_rx, collector_tx))
            })
            .collect::<std::io::Result<Box<[_]>>>()?;

        let ring = std::iter::repeat_with(|| None).take(max_inflights).collect();

        Ok(ParallelPipeline {
            injector: Some(injector),
            collector,
            next_to_send: 0,
            next_to_recv: 0,
            ring,
            in_flight: 0,
            threads,
        })
    }

    fn worker(
        format: wim_codecs::Format,
        chunk_size: u32,
        injector: mpmc::Receiver<Task>,
        collector: mpmc::Sender<TaskDone>,
    ) {
        let mut compressor =
            wim_codecs::Compressor::new(format, chunk_size).expect("chunk size validated earlier");
        while let Ok((index, chunk)) = injector.recv() {
            let compressed =
                panic::catch_unwind(panic::AssertUnwindSafe(|| compressor.compress(&chunk)));
            let result = match compressed {
                Ok(compressed) => ChunkResult {
                    uncompressed: chunk,
                    compressed,
                },
                Err(_) => break,
            };
            if collector.send((index, result)).is_err() {
                break;
            }
        }
    }

    fn submit(&mut self, chunk: Vec<u8>, done: &mut Vec<ChunkResult>) {
        let index = self.next_to_send;
        self.next_to_send += 1;
        if self.next_to_send == self.ring.len() {
            self.next_to_send = 0;
        }

        // If the ring slot we are about to reuse is the bottleneck, block
        // until it completes.
        if self.next_to_send == self.next_to_recv {
            while self.ring[self.next_to_recv].is_none() {
                let (idx, result) = self.collector.recv().expect("worker pool closed");
                self.put_result(idx, result);
            }
        }

        self.injector
            .as_ref()
            .expect("pipeline closed")
            .try_send((index, chunk))
            .expect("injector cannot be full");
        self.in_flight += 1;

        while let Ok((idx, result)) = self.collector.try_recv() {
            self.put_result(idx, result);
        }
        self.take_ready(done);
    }

    fn drain(&mut self, done: &mut Vec<ChunkResult>) {
        self.take_ready(done);
        while self.in_flight > 0 {
            let (idx, result) = self.collector.recv().expect("worker pool closed");
            self.put_result(idx, result);
            self.take_ready(done);
        }
    }

    fn put_result(&mut self, idx: usize, result: ChunkResult) {
        assert!(self.ring[idx].is_none(), "completion ring overflowed");
        self.ring[idx] = Some(result);
    }

    fn take_ready(&mut self, done: &mut Vec<ChunkResult>) {
        while let Some(result) = self.ring[self.next_to_recv].take() {
            self.next_to_recv += 1;
            if self.next_to_recv == self.ring.len() {
                self.next_to_recv = 0;
            }
            self.in_flight -= 1;
            done.push(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_pipeline(threads: u32, chunks: usize) {
        let mut pipeline = ChunkPipeline::new(CompressionType::Xpress, 1 << 15, threads).unwrap();
        let mut done = Vec::new();
        for i in 0..chunks {
            // Vary compressibility so both raw and compressed results occur.
            let chunk: Vec<u8> = if i % 3 == 0 {
                (0..1 << 15).map(|j| (j as u64 * 2654435761 >> 7) as u8).collect()
            } else {
                vec![i as u8; 1 << 15]
            };
            pipeline.submit(chunk, &mut done);
        }
        pipeline.drain(&mut done);
        assert_eq!(done.len(), chunks);

        // Results arrive in submission order.
        for (i, result) in done.iter().enumerate() {
            let expected_first = if i % 3 == 0 {
                (0u64 * 2654435761 >> 7) as u8
            } else {
                i as u8
            };
            assert_eq!(result.uncompressed[0], expected_first);
            if i % 3 != 0 {
                // Constant chunks must compress.
                assert!(result.compressed.is_some());
            }
        }
    }

    #[test]
    fn serial_pipeline_ordered() {
        run_pipeline(1, 17);
    }

    #[test]
    fn parallel_pipeline_ordered() {
        run_pipeline(4, 64);
    }

    #[test]
    fn drain_is_reusable_between_resources() {
        let mut pipeline = ChunkPipeline::new(CompressionType::Lzx, 1 << 15, 3).unwrap();
        for _ in 0..3 {
            let mut done = Vec::new();
            for i in 0..10u8 {
                pipeline.submit(vec![i; 1 << 15], &mut done);
            }
            pipeline.drain(&mut done);
            assert_eq!(done.len(), 10);
            for (i, r) in done.iter().enumerate() {
                assert_eq!(r.uncompressed[0], i as u8);
            }
        }
    }
}
