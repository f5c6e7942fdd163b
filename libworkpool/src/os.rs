/*
 * Created on Fri Mar 17 2023
 *
 * This file is a part of Workpool
 * Workpool is a free and open-source process-backed task executor written
 * by Sayan Nandan ("the Author") with the vision to contain crash-prone,
 * CPU-bound and runaway workloads without compromising on throughput or
 * reliability.
 *
 * Copyright (c) 2023, Sayan Nandan <ohsayan@outlook.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! Thin wrappers over the handful of syscalls the pool needs for descriptor
//! plumbing and worker termination

#[cfg(unix)]
pub(crate) use unix::*;

#[cfg(unix)]
mod unix {
    use std::io::{Error as IoError, Result as IoResult};

    /// `dup(2)`: clone a descriptor into a fresh one
    pub fn duplicate_fd(fd: i32) -> IoResult<i32> {
        let new_fd = unsafe { libc::dup(fd) };
        if new_fd < 0 {
            Err(IoError::last_os_error())
        } else {
            Ok(new_fd)
        }
    }

    /// `dup2(2)`: make `target` refer to the same open description as `src`
    pub fn redirect_fd(src: i32, target: i32) -> IoResult<()> {
        if unsafe { libc::dup2(src, target) } < 0 {
            Err(IoError::last_os_error())
        } else {
            Ok(())
        }
    }

    pub fn close_fd(fd: i32) {
        unsafe {
            libc::close(fd);
        }
    }

    /// Ask a process to terminate (SIGTERM). The caller escalates to
    /// SIGKILL if it does not comply in time
    pub fn send_sigterm(pid: u32) -> IoResult<()> {
        if unsafe { libc::kill(pid as i32, libc::SIGTERM) } != 0 {
            Err(IoError::last_os_error())
        } else {
            Ok(())
        }
    }

    #[test]
    fn duplicated_fds_are_fresh() {
        let fd = duplicate_fd(0).unwrap();
        assert!(fd > 2);
        close_fd(fd);
    }
}
