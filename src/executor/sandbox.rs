/// This file contains the memory the harness runs in: the sandbox that test
/// programs address through r14 and the page that holds their code. Both are
/// plain anonymous `mmap` regions that get unmapped when dropped
use crate::err::FuzzErr;
use crate::input::Input;
use crate::program::{SandboxLayout, FAULTY_REGION_SIZE, MAIN_REGION_SIZE};

// Duh
pub const PAGE_SIZE: usize = 0x1000;

// Room for the epilogue, prologue and body of any sane program
pub const CODE_SIZE: usize = PAGE_SIZE * 16;

/// An anonymous mapping
pub struct Region {
    base: *mut u8,
    len: usize,
}

impl Region {
    pub fn map(len: usize, prot: libc::c_int) -> Result<Self, FuzzErr> {
        // We don't care where it's mapped
        let addr = std::ptr::null_mut::<libc::c_void>();

        // Page-align the len
        let len = (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);

        // No file backing
        let flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;

        let result = unsafe { libc::mmap(addr, len, prot, flags, -1, 0) };
        if result == libc::MAP_FAILED {
            return Err(FuzzErr::os("Failed to mmap harness memory"));
        }

        Ok(Region {
            base: result as *mut u8,
            len,
        })
    }

    /// Change protection of `len` bytes at page aligned `offset`
    pub fn protect(&self, offset: usize, len: usize, prot: libc::c_int) -> Result<(), FuzzErr> {
        if offset % PAGE_SIZE != 0 || offset + len > self.len {
            return Err(FuzzErr::Executor(format!(
                "Bad protection range {:#x}+{:#x}",
                offset, len
            )));
        }

        let ret = unsafe {
            libc::mprotect(
                self.base.add(offset) as *mut libc::c_void,
                len,
                prot,
            )
        };
        if ret != 0 {
            return Err(FuzzErr::os("Failed to mprotect harness memory"));
        }

        Ok(())
    }

    #[inline]
    pub fn addr(&self) -> u64 {
        self.base as u64
    }

    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

/// The memory test programs address. The main page is filled from the input,
/// the page after it is inaccessible when the faulty page is enabled
pub struct Sandbox {
    region: Region,
}

impl Sandbox {
    pub fn new(layout: SandboxLayout) -> Result<Self, FuzzErr> {
        let region = Region::map(
            MAIN_REGION_SIZE + FAULTY_REGION_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
        )?;

        if layout.faulty_page {
            region.protect(MAIN_REGION_SIZE, FAULTY_REGION_SIZE, libc::PROT_NONE)?;
        }

        Ok(Sandbox { region })
    }

    /// Base address that goes into r14
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.region.as_mut_ptr()
    }

    /// Copy an input's memory into the main page
    pub fn load(&mut self, input: &Input) {
        let main = unsafe { std::slice::from_raw_parts_mut(self.base() as *mut u64, input.memory.len()) };
        main.copy_from_slice(&input.memory);
    }
}

/// Executable page for the harness. Written while RW, then flipped to RX
pub struct CodePage {
    region: Region,
    used: usize,
}

impl CodePage {
    pub fn new() -> Result<Self, FuzzErr> {
        let region = Region::map(CODE_SIZE, libc::PROT_READ | libc::PROT_EXEC)?;
        Ok(CodePage { region, used: 0 })
    }

    /// Where code will live, needed before assembling
    pub fn addr(&self) -> u64 {
        self.region.addr()
    }

    /// Replace the page contents
    pub fn install(&mut self, code: &[u8]) -> Result<(), FuzzErr> {
        if code.len() > self.region.len() {
            return Err(FuzzErr::Executor(format!(
                "Harness code of {:#x} bytes does not fit the {:#x} byte code page",
                code.len(),
                self.region.len()
            )));
        }

        self.region
            .protect(0, self.region.len(), libc::PROT_READ | libc::PROT_WRITE)?;

        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), self.region.as_mut_ptr(), code.len());
        }

        self.region
            .protect(0, self.region.len(), libc::PROT_READ | libc::PROT_EXEC)?;
        self.used = code.len();

        Ok(())
    }

    /// Address range of the installed code
    pub fn range(&self) -> (u64, u64) {
        (self.addr(), self.addr() + self.used as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::InputGenerator;

    #[test]
    fn sandbox_is_page_aligned_and_loads_input() {
        let Ok(mut sandbox) = Sandbox::new(SandboxLayout::default()) else {
            return;
        };
        assert_eq!(sandbox.base() as usize % PAGE_SIZE, 0);

        let input = InputGenerator::new(8).unwrap().random_input(9);
        sandbox.load(&input);
        let word = unsafe { *(sandbox.base() as *const u64).add(17) };
        assert_eq!(word, input.memory[17]);
    }

    #[test]
    fn code_page_rejects_oversized_code() {
        let Ok(mut page) = CodePage::new() else {
            return;
        };
        assert!(page.install(&vec![0xC3; CODE_SIZE + 1]).is_err());
        page.install(&[0xC3]).unwrap();
        assert_eq!(page.range().1 - page.range().0, 1);
    }
}
