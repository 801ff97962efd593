//! Which operations the running kernel accepts.

use std::fmt;

use io_uring::opcode;

/// The operations a ring can stage.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Op {
    Nop,
    Timeout,
    OpenAt2,
    UnlinkAt,
    PollAdd,
    Read,
    Write,
    Readv,
    Writev,
    ReadFixed,
    WriteFixed,
    Splice,
    Statx,
    Connect,
    Accept,
    Close,
    AsyncCancel,
}

impl Op {
    pub const ALL: [Op; 17] = [
        Op::Nop,
        Op::Timeout,
        Op::OpenAt2,
        Op::UnlinkAt,
        Op::PollAdd,
        Op::Read,
        Op::Write,
        Op::Readv,
        Op::Writev,
        Op::ReadFixed,
        Op::WriteFixed,
        Op::Splice,
        Op::Statx,
        Op::Connect,
        Op::Accept,
        Op::Close,
        Op::AsyncCancel,
    ];

    /// The kernel's `IORING_OP_*` code.
    pub fn code(self) -> u8 {
        match self {
            Op::Nop => opcode::Nop::CODE,
            Op::Timeout => opcode::Timeout::CODE,
            Op::OpenAt2 => opcode::OpenAt2::CODE,
            Op::UnlinkAt => opcode::UnlinkAt::CODE,
            Op::PollAdd => opcode::PollAdd::CODE,
            Op::Read => opcode::Read::CODE,
            Op::Write => opcode::Write::CODE,
            Op::Readv => opcode::Readv::CODE,
            Op::Writev => opcode::Writev::CODE,
            Op::ReadFixed => opcode::ReadFixed::CODE,
            Op::WriteFixed => opcode::WriteFixed::CODE,
            Op::Splice => opcode::Splice::CODE,
            Op::Statx => opcode::Statx::CODE,
            Op::Connect => opcode::Connect::CODE,
            Op::Accept => opcode::Accept::CODE,
            Op::Close => opcode::Close::CODE,
            Op::AsyncCancel => opcode::AsyncCancel::CODE,
        }
    }
}

/// A snapshot of the opcodes supported by the kernel, taken with
/// [`Ring::probe`](crate::Ring::probe).
pub struct Probe {
    inner: io_uring::Probe,
}

impl Probe {
    pub(crate) fn new(inner: io_uring::Probe) -> Self {
        Self { inner }
    }
    pub fn op_supported(&self, op: Op) -> bool {
        self.inner.is_supported(op.code())
    }
    /// Every operation of [`Op::ALL`] the kernel accepts.
    pub fn supported(&self) -> impl Iterator<Item = Op> + '_ {
        Op::ALL.iter().copied().filter(move |&op| self.op_supported(op))
    }
}

impl fmt::Debug for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.supported()).finish()
    }
}
