/*
 * Created on Mon Mar 20 2023
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

//! The frame protocol spoken between the controller and its workers
//!
//! Each frame is a `u64` little-endian length followed by a bincode body.
//! The pipes carrying the frames are private to one worker, so no
//! multiplexing or sequencing is needed on top.

use {
    crate::task::{Task, TaskId, TaskOutcome},
    serde::{de::DeserializeOwned, Deserialize, Serialize},
    std::io::{self, Read, Write},
};

/// What the controller sends down to a worker
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum WorkOrder<J> {
    /// run this task
    Run(Task<J>),
    /// stop cleanly (the shutdown sentinel)
    Stop,
}

/// What a worker reports back
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum WorkerEvent<R> {
    /// the worker picked the task up and owns it from here
    Started { id: TaskId, pid: u32 },
    /// the task settled, one way or the other
    Finished(TaskOutcome<R>),
}

pub(crate) fn write_frame<T: Serialize>(stream: &mut impl Write, frame: &T) -> io::Result<()> {
    let body =
        bincode::serialize(frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    stream.write_all(&(body.len() as u64).to_le_bytes())?;
    stream.write_all(&body)?;
    stream.flush()
}

pub(crate) fn read_frame<T: DeserializeOwned>(stream: &mut impl Read) -> io::Result<T> {
    let mut len = [0u8; 8];
    stream.read_exact(&mut len)?;
    let mut body = vec![0u8; u64::from_le_bytes(len) as usize];
    stream.read_exact(&mut body)?;
    bincode::deserialize(&body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use {
        super::{read_frame, write_frame, WorkOrder, WorkerEvent},
        crate::{
            task::{Task, TaskOutcome},
            test_utils,
        },
        std::io::Cursor,
    };

    #[test]
    fn orders_survive_the_pipe() {
        test_utils::init_logger();
        let payload = test_utils::random_string(&mut rand::thread_rng(), 64);
        let order: WorkOrder<String> = WorkOrder::Run(Task {
            id: "some-task".to_owned(),
            job: payload.clone(),
        });
        let mut buf = Vec::new();
        write_frame(&mut buf, &order).unwrap();
        match read_frame::<WorkOrder<String>>(&mut Cursor::new(buf)).unwrap() {
            WorkOrder::Run(task) => {
                assert_eq!(task.id, "some-task");
                assert_eq!(task.job, payload);
            }
            WorkOrder::Stop => panic!("read back the wrong variant"),
        }
    }

    #[test]
    fn failure_events_survive_the_pipe() {
        test_utils::init_logger();
        let event: WorkerEvent<u64> = WorkerEvent::Finished(TaskOutcome {
            id: "some-task".to_owned(),
            value: None,
            error: Some("panicked: boom".to_owned()),
            logs: "partial output\npanicked: boom".to_owned(),
        });
        let mut buf = Vec::new();
        write_frame(&mut buf, &event).unwrap();
        match read_frame::<WorkerEvent<u64>>(&mut Cursor::new(buf)).unwrap() {
            WorkerEvent::Finished(outcome) => {
                assert!(outcome.value.is_none());
                assert_eq!(outcome.error.as_deref(), Some("panicked: boom"));
                assert!(outcome.logs.contains("partial output"));
            }
            WorkerEvent::Started { .. } => panic!("read back the wrong variant"),
        }
    }
}
