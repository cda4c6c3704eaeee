use std::{
    panic::{self, AssertUnwindSafe},
    sync::{mpsc, Arc, Mutex, RwLock},
};

use pool::{BufferPool, PooledBuffer, SharedPool};

use crate::{
    device::{BufferDesc, Device, Parameters, Submission, View},
    Dims, Error, Operation, Result, Shape, Tensor,
};

mod kernels;
mod pool;

pub use kernels::CpuKernel;
pub use pool::PoolMetrics;

type Command = Box<dyn FnOnce() -> Result<()> + Send>;

/// Run one command, turning a panicking kernel into an error for the submitter.
fn run(command: Command) -> Result<()> {
    panic::catch_unwind(AssertUnwindSafe(command)).unwrap_or_else(|payload| {
        let reason = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown cause".to_string());
        log::error!("cpu command panicked: {reason}");
        Err(Error::msg(format!("cpu command panicked: {reason}")))
    })
}

/// Host memory buffer. Clones share the same storage.
#[derive(Clone, Debug)]
pub struct CpuBuffer {
    data: Arc<RwLock<PooledBuffer>>,
    dims: Dims,
}

impl CpuBuffer {
    fn new(buf: PooledBuffer, dims: Dims) -> Self {
        Self {
            data: Arc::new(RwLock::new(buf)),
            dims,
        }
    }

    pub fn dims(&self) -> Dims {
        self.dims
    }

    /// Whether both handles refer to the same storage.
    pub fn same_storage(&self, other: &CpuBuffer) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    fn read<R>(&self, f: impl FnOnce(&[f32]) -> R) -> Result<R> {
        let guard = self
            .data
            .read()
            .map_err(|_| Error::msg("cpu buffer lock poisoned"))?;
        Ok(f(&guard))
    }

    fn write<R>(&self, f: impl FnOnce(&mut [f32]) -> R) -> Result<R> {
        let mut guard = self
            .data
            .write()
            .map_err(|_| Error::msg("cpu buffer lock poisoned"))?;
        Ok(f(&mut guard))
    }
}

/// Commands recorded during one `encode`, plus the ephemeral buffers they keep alive.
#[derive(Default)]
pub struct CpuCommands {
    commands: Vec<Command>,
    ephemeral: Vec<CpuBuffer>,
}

impl CpuCommands {
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

pub struct CpuSubmission {
    rx: mpsc::Receiver<Result<()>>,
}

impl Submission for CpuSubmission {
    fn wait(self) -> Result<()> {
        self.rx.recv().map_err(Error::wrap)?
    }
}

/// Runs graphs on the host. Commands execute in order on the rayon pool; kernels
/// parallelize internally.
#[derive(Clone, Debug)]
pub struct CpuDevice {
    pool: SharedPool,
}

impl Default for CpuDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuDevice {
    pub fn new() -> Self {
        Self {
            pool: Arc::new(Mutex::new(BufferPool::new())),
        }
    }

    /// Snapshot of the recycling heap behind ephemeral buffers.
    pub fn pool_metrics(&self) -> Result<PoolMetrics> {
        let pool = self
            .pool
            .lock()
            .map_err(|_| Error::msg("cpu buffer pool poisoned"))?;
        Ok(pool.metrics())
    }
}

impl Device for CpuDevice {
    type Buffer = CpuBuffer;
    type Commands = CpuCommands;
    type Kernel = Arc<CpuKernel>;
    type Submission = CpuSubmission;

    fn new_commands(&self) -> CpuCommands {
        CpuCommands::default()
    }

    fn allocate_ephemeral(&self, desc: &BufferDesc, commands: &mut CpuCommands) -> Result<CpuBuffer> {
        let buf = self
            .pool
            .lock()
            .map_err(|_| Error::msg("cpu buffer pool poisoned"))?
            .get_buffer(desc.len());
        let buffer = CpuBuffer::new(PooledBuffer::new(buf, self.pool.clone()), desc.dims);
        commands.ephemeral.push(buffer.clone());
        Ok(buffer)
    }

    fn allocate_durable(&self, desc: &BufferDesc) -> Result<CpuBuffer> {
        Ok(CpuBuffer::new(
            PooledBuffer::detached(vec![0.0; desc.len()]),
            desc.dims,
        ))
    }

    fn build(
        &self,
        op: &Operation,
        input: Shape,
        output: Dims,
        params: Parameters,
    ) -> Result<Arc<CpuKernel>> {
        Ok(Arc::new(CpuKernel::new(op, input, output, params)?))
    }

    fn execute(
        &self,
        commands: &mut CpuCommands,
        kernel: &Arc<CpuKernel>,
        (src, src_view): (&CpuBuffer, View),
        (dst, dst_view): (&CpuBuffer, View),
    ) -> Result<()> {
        if src_view.extent != src.dims || dst_view.extent != dst.dims {
            return Err(Error::invariant("view extent does not match its buffer"));
        }
        if !src_view.fits() || !dst_view.fits() {
            return Err(Error::invariant("view lies outside its buffer"));
        }
        let kernel = kernel.clone();
        let src = src.clone();
        let dst = dst.clone();
        commands.commands.push(Box::new(move || {
            // Gathering first releases the read lock, so src and dst may share storage.
            let x = src.read(|data| src_view.gather(data))?;
            let y = kernel.forward(&x, dst_view.dims)?;
            dst.write(|data| dst_view.scatter(&y, data))
        }));
        Ok(())
    }

    fn clear(&self, commands: &mut CpuCommands, buffer: &CpuBuffer) -> Result<()> {
        let buffer = buffer.clone();
        commands
            .commands
            .push(Box::new(move || buffer.write(|data| data.fill(0.0))));
        Ok(())
    }

    fn submit(&self, commands: CpuCommands) -> CpuSubmission {
        let (tx, rx) = mpsc::channel();
        let pool = self.pool.clone();
        rayon::spawn(move || {
            let CpuCommands {
                commands,
                ephemeral,
            } = commands;
            let count = commands.len();
            let result = commands.into_iter().try_for_each(run);
            drop(ephemeral);
            if let Ok(pool) = pool.lock() {
                log::debug!(
                    "ran {count} cpu commands, {} buffers pooled, {:?}",
                    pool.len(),
                    pool.metrics
                );
            }
            // The receiver may already be gone if nobody waits on this submission.
            let _ = tx.send(result);
        });
        CpuSubmission { rx }
    }

    fn dims(&self, buffer: &CpuBuffer) -> Dims {
        buffer.dims
    }

    fn upload(&self, tensor: &Tensor) -> Result<CpuBuffer> {
        Ok(CpuBuffer::new(
            PooledBuffer::detached(tensor.data().to_vec()),
            tensor.dims(),
        ))
    }

    fn download(&self, buffer: &CpuBuffer, view: View) -> Result<Tensor> {
        if view.extent != buffer.dims || !view.fits() {
            crate::bail!("cannot read {:?} from a buffer of {}", view, buffer.dims);
        }
        buffer.read(|data| view.gather(data))
    }
}
