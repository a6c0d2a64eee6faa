use crate::error::{CommError, Result};
use crate::transport::{RecvOutcome, RemoveOutcome, SendOutcome, Transport};
use anyhow::anyhow;
use async_trait::async_trait;
use nix::errno::Errno;
use rand::Rng;
use tracing::{debug, trace};

/// Permission bits for queues this process creates.
const QUEUE_MODE: libc::c_int = 0o600;

/// Fixed message type header. Receives match any type, so the value only
/// has to be positive.
const MSG_TYPE: libc::c_long = 1;

/// How many random keys to probe before giving up on queue creation.
const MAX_KEY_ATTEMPTS: usize = 64;

/// System V message queue handle.
///
/// The queue identifier is resolved once from the key; if the queue is
/// removed out from under us, operations report `Gone` rather than
/// re-resolving, matching how the kernel invalidates the id.
#[derive(Debug)]
pub struct SysvQueueTransport {
    key_str: String,
    id: libc::c_int,
    max_payload: usize,
}

impl SysvQueueTransport {
    /// Create a brand-new queue under a random unused key.
    pub async fn create_new(max_payload: usize) -> Result<Self> {
        let (key, id) = run_blocking(move || {
            let mut rng = rand::thread_rng();
            for _ in 0..MAX_KEY_ATTEMPTS {
                let key: libc::c_int = rng.gen_range(1..libc::c_int::MAX);
                let id = unsafe {
                    libc::msgget(key, libc::IPC_CREAT | libc::IPC_EXCL | QUEUE_MODE)
                };
                if id >= 0 {
                    return Ok((key, id));
                }
                match Errno::last() {
                    Errno::EEXIST => continue,
                    errno => {
                        return Err(CommError::Backend(anyhow!(
                            "msgget(key={}) failed: {}",
                            key,
                            errno
                        )))
                    }
                }
            }
            Err(CommError::Backend(anyhow!(
                "no free System V key after {} attempts",
                MAX_KEY_ATTEMPTS
            )))
        })
        .await?;

        debug!("Created System V queue key={} id={}", key, id);
        Ok(Self {
            key_str: key.to_string(),
            id,
            max_payload,
        })
    }

    /// Open an existing queue by its decimal key string. `Ok(None)` when no
    /// queue with that key exists.
    pub async fn attach(key_str: &str, max_payload: usize) -> Result<Option<Self>> {
        let key: libc::c_int = key_str
            .trim()
            .parse()
            .map_err(|_| CommError::Backend(anyhow!("invalid System V key '{}'", key_str)))?;

        let id = run_blocking(move || {
            let id = unsafe { libc::msgget(key, 0) };
            if id >= 0 {
                return Ok(Some(id));
            }
            match Errno::last() {
                Errno::ENOENT => Ok(None),
                errno => Err(CommError::Backend(anyhow!(
                    "msgget(key={}) failed: {}",
                    key,
                    errno
                ))),
            }
        })
        .await?;

        Ok(id.map(|id| {
            debug!("Attached to System V queue key={} id={}", key, id);
            Self {
                key_str: key.to_string(),
                id,
                max_payload,
            }
        }))
    }

    /// Reject a payload above the configured ceiling before it reaches the
    /// kernel. `msgsnd` reports an oversized message as `EINVAL`, the same
    /// errno a removed queue raises, and that must keep meaning gone.
    fn check_payload_fits(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_payload {
            return Err(CommError::Backend(anyhow!(
                "payload of {} byte(s) exceeds the {} byte limit of queue {}",
                payload.len(),
                self.max_payload,
                self.key_str
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for SysvQueueTransport {
    fn key(&self) -> &str {
        &self.key_str
    }

    fn max_payload(&self) -> usize {
        self.max_payload
    }

    async fn pending(&self) -> Result<Option<usize>> {
        let id = self.id;
        run_blocking(move || {
            let mut stat: libc::msqid_ds = unsafe { std::mem::zeroed() };
            let rc = unsafe { libc::msgctl(id, libc::IPC_STAT, &mut stat) };
            if rc == 0 {
                return Ok(Some(stat.msg_qnum as usize));
            }
            match Errno::last() {
                Errno::EIDRM | Errno::EINVAL => Ok(None),
                errno => Err(CommError::Backend(anyhow!(
                    "msgctl(IPC_STAT) on queue {} failed: {}",
                    id,
                    errno
                ))),
            }
        })
        .await
    }

    async fn try_send(&self, payload: &[u8]) -> Result<SendOutcome> {
        self.check_payload_fits(payload)?;
        let id = self.id;
        let len = payload.len();
        let buf = msgbuf_with_payload(payload);
        let outcome = run_blocking(move || {
            let rc = unsafe {
                libc::msgsnd(id, buf.as_ptr() as *const libc::c_void, len, libc::IPC_NOWAIT)
            };
            if rc == 0 {
                return Ok(SendOutcome::Sent);
            }
            match Errno::last() {
                Errno::EAGAIN => Ok(SendOutcome::Full),
                Errno::EIDRM | Errno::EINVAL => Ok(SendOutcome::Gone),
                errno => Err(CommError::Backend(anyhow!(
                    "msgsnd on queue {} failed: {}",
                    id,
                    errno
                ))),
            }
        })
        .await?;
        trace!("try_send of {} byte(s) on queue {}: {:?}", len, id, outcome);
        Ok(outcome)
    }

    async fn send_wait(&self, payload: &[u8]) -> Result<SendOutcome> {
        self.check_payload_fits(payload)?;
        let id = self.id;
        let len = payload.len();
        let buf = msgbuf_with_payload(payload);
        let outcome = run_blocking(move || loop {
            let rc = unsafe { libc::msgsnd(id, buf.as_ptr() as *const libc::c_void, len, 0) };
            if rc == 0 {
                return Ok(SendOutcome::Sent);
            }
            match Errno::last() {
                Errno::EINTR => continue,
                Errno::EIDRM | Errno::EINVAL => return Ok(SendOutcome::Gone),
                errno => {
                    return Err(CommError::Backend(anyhow!(
                        "msgsnd on queue {} failed: {}",
                        id,
                        errno
                    )))
                }
            }
        })
        .await?;
        trace!("send_wait of {} byte(s) on queue {}: {:?}", len, id, outcome);
        Ok(outcome)
    }

    async fn try_recv(&self) -> Result<RecvOutcome> {
        let id = self.id;
        let max_payload = self.max_payload;
        run_blocking(move || {
            let header = std::mem::size_of::<libc::c_long>();
            let words = (header + max_payload + 7) / 8;
            let mut buf: Vec<u64> = vec![0; words.max(1)];
            let rc = unsafe {
                libc::msgrcv(
                    id,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    max_payload,
                    0, // first message of any type
                    libc::IPC_NOWAIT,
                )
            };
            if rc >= 0 {
                let len = rc as usize;
                let payload = unsafe {
                    std::slice::from_raw_parts((buf.as_ptr() as *const u8).add(header), len)
                };
                return Ok(RecvOutcome::Received(payload.to_vec()));
            }
            match Errno::last() {
                Errno::ENOMSG => Ok(RecvOutcome::Empty),
                Errno::EIDRM | Errno::EINVAL => Ok(RecvOutcome::Gone),
                errno => Err(CommError::Backend(anyhow!(
                    "msgrcv on queue {} failed: {}",
                    id,
                    errno
                ))),
            }
        })
        .await
    }

    async fn remove(&self) -> Result<RemoveOutcome> {
        let id = self.id;
        let outcome = run_blocking(move || {
            let rc = unsafe { libc::msgctl(id, libc::IPC_RMID, std::ptr::null_mut()) };
            if rc == 0 {
                return Ok(RemoveOutcome::Removed);
            }
            match Errno::last() {
                Errno::EIDRM | Errno::EINVAL => Ok(RemoveOutcome::AlreadyGone),
                errno => Err(CommError::Backend(anyhow!(
                    "msgctl(IPC_RMID) on queue {} failed: {}",
                    id,
                    errno
                ))),
            }
        })
        .await?;
        debug!("Removed System V queue id={}: {:?}", id, outcome);
        Ok(outcome)
    }
}

/// Build a System V message buffer: a `c_long` type header followed by the
/// payload bytes. Backing it with `u64` keeps the header aligned.
fn msgbuf_with_payload(payload: &[u8]) -> Vec<u64> {
    let header = std::mem::size_of::<libc::c_long>();
    let words = (header + payload.len() + 7) / 8;
    let mut buf: Vec<u64> = vec![0; words.max(1)];
    unsafe {
        *(buf.as_mut_ptr() as *mut libc::c_long) = MSG_TYPE;
        std::ptr::copy_nonoverlapping(
            payload.as_ptr(),
            (buf.as_mut_ptr() as *mut u8).add(header),
            payload.len(),
        );
    }
    buf
}

/// Run a System V syscall wrapper off the async runtime.
async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(join) => Err(CommError::Backend(anyhow!(
            "blocking queue task failed: {}",
            join
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msgbuf_layout() {
        let payload = [0xAAu8, 0xBB, 0xCC];
        let buf = msgbuf_with_payload(&payload);
        let header = std::mem::size_of::<libc::c_long>();

        let mtype = unsafe { *(buf.as_ptr() as *const libc::c_long) };
        assert_eq!(mtype, MSG_TYPE);

        let bytes = unsafe {
            std::slice::from_raw_parts((buf.as_ptr() as *const u8).add(header), payload.len())
        };
        assert_eq!(bytes, &payload);
    }

    #[test]
    fn test_msgbuf_empty_payload_still_holds_header() {
        let buf = msgbuf_with_payload(&[]);
        assert!(!buf.is_empty());
        let mtype = unsafe { *(buf.as_ptr() as *const libc::c_long) };
        assert_eq!(mtype, MSG_TYPE);
    }

    #[tokio::test]
    async fn test_attach_rejects_malformed_key() {
        let result = SysvQueueTransport::attach("not-a-key", 2048).await;
        assert!(result.is_err());
    }
}
