//! Queues between the tasks and the packet router.

use embassy_sync::channel::Channel;
use heapless::{Deque, Vec};

use crate::config::{ROUTER_FIFO_DEPTH, ROUTER_PACKET_LEN};
use crate::ids::TaskId;
use crate::sync::ObcMutex;

pub type Packet = Vec<u8, ROUTER_PACKET_LEN>;
pub type RouterFifo = Channel<ObcMutex, Packet, ROUTER_FIFO_DEPTH>;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    TaskToRouter,
    RouterToTask,
}

impl Direction {
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// One queue per task and direction.
pub struct RouterFifos {
    to_router: [RouterFifo; TaskId::COUNT],
    to_task: [RouterFifo; TaskId::COUNT],
}

impl Default for RouterFifos {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterFifos {
    pub const fn new() -> Self {
        Self {
            to_router: [const { Channel::new() }; TaskId::COUNT],
            to_task: [const { Channel::new() }; TaskId::COUNT],
        }
    }

    pub fn fifo(&self, task: TaskId, direction: Direction) -> &RouterFifo {
        match direction {
            Direction::TaskToRouter => &self.to_router[task.index()],
            Direction::RouterToTask => &self.to_task[task.index()],
        }
    }

    /// Tear a queue down and build it up again, carrying over the packets it
    /// held in order. Returns how many packets were preserved.
    pub fn recreate(&self, task: TaskId, direction: Direction) -> usize {
        let fifo = self.fifo(task, direction);
        let mut spare: Deque<Packet, ROUTER_FIFO_DEPTH> = Deque::new();
        while let Ok(packet) = fifo.try_receive() {
            if spare.push_back(packet).is_err() {
                break;
            }
        }
        fifo.clear();
        let preserved = spare.len();
        while let Some(packet) = spare.pop_front() {
            if fifo.try_send(packet).is_err() {
                break;
            }
        }
        debug!("router: recreated {:?} queue of {:?} with {} packets", direction, task, preserved);
        preserved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(tag: u8) -> Packet {
        Vec::from_slice(&[tag, tag]).unwrap()
    }

    #[test]
    fn recreate_preserves_order() {
        let fifos = RouterFifos::new();
        let fifo = fifos.fifo(TaskId::Coms, Direction::RouterToTask);
        for tag in 0..3 {
            fifo.try_send(packet(tag)).unwrap();
        }

        assert_eq!(fifos.recreate(TaskId::Coms, Direction::RouterToTask), 3);
        for tag in 0..3 {
            assert_eq!(fifo.try_receive().unwrap(), packet(tag));
        }
        assert!(fifos.fifo(TaskId::Coms, Direction::TaskToRouter).is_empty());
    }
}
