use std::os::fd::RawFd;
use std::time::Duration;

/// Result of one [`wait_readable`] call, indexed like the input descriptors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Readiness {
    ready: Vec<bool>,
}

impl Readiness {
    /// Whether the descriptor at `index` can be read without blocking.
    ///
    /// Hang-ups and errors count as readable so the following read reports them.
    pub fn is_ready(&self, index: usize) -> bool {
        self.ready.get(index).copied().unwrap_or(false)
    }

    /// Whether any descriptor became ready.
    pub fn any(&self) -> bool {
        self.ready.iter().any(|r| *r)
    }
}

/// Block until at least one descriptor is readable or `timeout` elapses.
///
/// An interrupted wait returns an empty readiness set rather than an error;
/// callers loop anyway.
pub fn wait_readable(fds: &[RawFd], timeout: Duration) -> std::io::Result<Readiness> {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|fd| libc::pollfd {
            fd: *fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();

    let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

    // SAFETY: `pollfds` is a valid, exclusively borrowed array of
    // `pollfds.len()` initialized pollfd structs for the duration of the call.
    let rc = unsafe {
        libc::poll(
            pollfds.as_mut_ptr(),
            pollfds.len() as libc::nfds_t,
            timeout_ms,
        )
    };

    if rc < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            return Ok(Readiness {
                ready: vec![false; fds.len()],
            });
        }
        return Err(err);
    }

    let ready = pollfds
        .iter()
        .map(|p| p.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
        .collect();

    Ok(Readiness { ready })
}
