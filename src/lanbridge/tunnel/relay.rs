//! Duplex byte pump between two connected streams.
//!
//! Each direction reads with a deadline of `idle_timeout`. A deadline that
//! expires while the *other* direction moved bytes recently is retried, so a
//! one-way transfer does not trip the timeout. The first direction to end
//! (EOF, error, idle) ends the whole relay; both streams are shut down and
//! dropped before `relay` returns.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time,
};

use crate::lanbridge::tunnel::cryptor::Cryptor;

pub const RELAY_BUFFER_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// One side closed its write half.
    Eof,
    /// Neither side produced bytes for the idle timeout.
    Idle,
    /// Read or write failure on either side.
    Error,
}

#[derive(Debug, Clone, Copy)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
    pub end: RelayEnd,
}

/// Last successful read on either direction, in ms since `base`.
struct Activity {
    base: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            base: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let ms = self.base.elapsed().as_millis() as u64;
        self.last_ms.store(ms, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let now = self.base.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_ms.load(Ordering::Relaxed)))
    }
}

#[derive(Clone, Copy)]
enum Transform {
    Encrypt,
    Decrypt,
}

/// Relay `a` and `b` until one side ends.
///
/// Bytes flowing `a -> b` are encrypted and bytes flowing `b -> a` decrypted
/// when a cryptor is supplied. `idle_timeout == 0` disables the deadline.
pub async fn relay<A, B>(
    a: A,
    b: B,
    idle_timeout: Duration,
    cryptor: Option<Arc<dyn Cryptor>>,
) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Send + Unpin,
    B: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut ar, mut aw) = tokio::io::split(a);
    let (mut br, mut bw) = tokio::io::split(b);

    let activity = Activity::new();
    let a_to_b = AtomicU64::new(0);
    let b_to_a = AtomicU64::new(0);
    let cryptor = cryptor.as_deref();

    let end = {
        let up = pump(
            &mut ar,
            &mut bw,
            idle_timeout,
            &activity,
            cryptor.map(|c| (c, Transform::Encrypt)),
            &a_to_b,
        );
        let down = pump(
            &mut br,
            &mut aw,
            idle_timeout,
            &activity,
            cryptor.map(|c| (c, Transform::Decrypt)),
            &b_to_a,
        );
        tokio::pin!(up, down);

        // The losing direction is dropped here, which cancels its pending I/O.
        let res = tokio::select! {
            r = &mut up => r,
            r = &mut down => r,
        };
        match res {
            Ok(()) => RelayEnd::Eof,
            Err(err) if err.kind() == io::ErrorKind::TimedOut => RelayEnd::Idle,
            Err(_) => RelayEnd::Error,
        }
    };

    let _ = aw.shutdown().await;
    let _ = bw.shutdown().await;

    RelayStats {
        a_to_b: a_to_b.load(Ordering::Relaxed),
        b_to_a: b_to_a.load(Ordering::Relaxed),
        end,
    }
}

async fn pump<R, W>(
    src: &mut R,
    dst: &mut W,
    idle_timeout: Duration,
    activity: &Activity,
    transform: Option<(&dyn Cryptor, Transform)>,
    counter: &AtomicU64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_BYTES];
    loop {
        let n = if idle_timeout.is_zero() {
            src.read(&mut buf).await?
        } else {
            match time::timeout(idle_timeout, src.read(&mut buf)).await {
                Ok(r) => r?,
                Err(_) => {
                    if activity.idle_for() < idle_timeout {
                        continue;
                    }
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "relay idle timeout"));
                }
            }
        };
        if n == 0 {
            return Ok(());
        }
        activity.touch();

        let chunk = &mut buf[..n];
        match transform {
            Some((c, Transform::Encrypt)) => c.encrypt(chunk),
            Some((c, Transform::Decrypt)) => c.decrypt(chunk),
            None => {}
        }
        dst.write_all(chunk).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}
