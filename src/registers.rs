//! The x86-64 general-purpose and segment register set, stored verbatim in
//! the order ptrace's `PTRACE_GETREGS`/`PTRACE_SETREGS` and the artifact
//! format (see `codec`) both use.

use libc::user_regs_struct;

/// Order fixed by the artifact format (§6): 27 little-endian u64 fields.
pub const REGISTER_COUNT: usize = 27;

/// The full register file of a stopped x86-64 tracee. Stored verbatim; the
/// core never interprets individual bits beyond `rip`/`rsp`/`rax`/`orig_rax`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RegisterFile {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub orig_rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub eflags: u64,
    pub rsp: u64,
    pub ss: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
}

impl RegisterFile {
    /// Order used by both the wire format and `to_array`/`from_array`.
    pub const FIELD_ORDER: [&'static str; REGISTER_COUNT] = [
        "r15", "r14", "r13", "r12", "rbp", "rbx", "r11", "r10", "r9", "r8", "rax", "rcx", "rdx",
        "rsi", "rdi", "orig_rax", "rip", "cs", "eflags", "rsp", "ss", "fs_base", "gs_base", "ds",
        "es", "fs", "gs",
    ];

    pub fn from_ptrace(regs: &user_regs_struct) -> RegisterFile {
        RegisterFile {
            r15: regs.r15,
            r14: regs.r14,
            r13: regs.r13,
            r12: regs.r12,
            rbp: regs.rbp,
            rbx: regs.rbx,
            r11: regs.r11,
            r10: regs.r10,
            r9: regs.r9,
            r8: regs.r8,
            rax: regs.rax,
            rcx: regs.rcx,
            rdx: regs.rdx,
            rsi: regs.rsi,
            rdi: regs.rdi,
            orig_rax: regs.orig_rax,
            rip: regs.rip,
            cs: regs.cs,
            eflags: regs.eflags,
            rsp: regs.rsp,
            ss: regs.ss,
            fs_base: regs.fs_base,
            gs_base: regs.gs_base,
            ds: regs.ds,
            es: regs.es,
            fs: regs.fs,
            gs: regs.gs,
        }
    }

    pub fn to_ptrace(&self) -> user_regs_struct {
        // Safety: user_regs_struct is a plain C struct of integers; zeroed
        // is a valid starting value for every field we don't set below.
        let mut regs: user_regs_struct = unsafe { std::mem::zeroed() };
        regs.r15 = self.r15;
        regs.r14 = self.r14;
        regs.r13 = self.r13;
        regs.r12 = self.r12;
        regs.rbp = self.rbp;
        regs.rbx = self.rbx;
        regs.r11 = self.r11;
        regs.r10 = self.r10;
        regs.r9 = self.r9;
        regs.r8 = self.r8;
        regs.rax = self.rax;
        regs.rcx = self.rcx;
        regs.rdx = self.rdx;
        regs.rsi = self.rsi;
        regs.rdi = self.rdi;
        regs.orig_rax = self.orig_rax;
        regs.rip = self.rip;
        regs.cs = self.cs;
        regs.eflags = self.eflags;
        regs.rsp = self.rsp;
        regs.ss = self.ss;
        regs.fs_base = self.fs_base;
        regs.gs_base = self.gs_base;
        regs.ds = self.ds;
        regs.es = self.es;
        regs.fs = self.fs;
        regs.gs = self.gs;
        regs
    }

    /// Field values in wire order, matching `FIELD_ORDER` and the artifact
    /// layout (§6).
    pub fn to_array(&self) -> [u64; REGISTER_COUNT] {
        [
            self.r15,
            self.r14,
            self.r13,
            self.r12,
            self.rbp,
            self.rbx,
            self.r11,
            self.r10,
            self.r9,
            self.r8,
            self.rax,
            self.rcx,
            self.rdx,
            self.rsi,
            self.rdi,
            self.orig_rax,
            self.rip,
            self.cs,
            self.eflags,
            self.rsp,
            self.ss,
            self.fs_base,
            self.gs_base,
            self.ds,
            self.es,
            self.fs,
            self.gs,
        ]
    }

    pub fn from_array(v: &[u64; REGISTER_COUNT]) -> RegisterFile {
        RegisterFile {
            r15: v[0],
            r14: v[1],
            r13: v[2],
            r12: v[3],
            rbp: v[4],
            rbx: v[5],
            r11: v[6],
            r10: v[7],
            r9: v[8],
            r8: v[9],
            rax: v[10],
            rcx: v[11],
            rdx: v[12],
            rsi: v[13],
            rdi: v[14],
            orig_rax: v[15],
            rip: v[16],
            cs: v[17],
            eflags: v[18],
            rsp: v[19],
            ss: v[20],
            fs_base: v[21],
            gs_base: v[22],
            ds: v[23],
            es: v[24],
            fs: v[25],
            gs: v[26],
        }
    }

    /// Apply an ASLR shift to `rip`, assuming the caller has already
    /// confirmed the captured rip falls inside the shifted text region.
    pub fn shifted(&self, shift: i64) -> RegisterFile {
        let mut r = *self;
        r.rip = (r.rip as i64 + shift) as u64;
        r
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn array_round_trip() {
        let mut v = [0u64; REGISTER_COUNT];
        for (i, slot) in v.iter_mut().enumerate() {
            *slot = i as u64 * 7 + 1;
        }
        let regs = RegisterFile::from_array(&v);
        assert_eq!(regs.to_array(), v);
    }

    #[test]
    fn shifted_only_touches_rip() {
        let regs = RegisterFile::from_array(&[0u64; REGISTER_COUNT]);
        let shifted = regs.shifted(0x1000);
        assert_eq!(shifted.rip, 0x1000);
        assert_eq!(shifted.rsp, 0);
    }
}
