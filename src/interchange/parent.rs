/// Reports the current parent process id.
pub trait ParentProbe: Send + Sync {
    fn parent_pid(&self) -> u32;
}

/// Asks the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsParent;

impl ParentProbe for OsParent {
    fn parent_pid(&self) -> u32 {
        std::os::unix::process::parent_id()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentMismatch {
    pub expected: u32,
    pub actual: u32,
}

/// Checks that the process that launched us is still our parent.
///
/// With no expected pid configured every check passes.
pub struct ParentGuard {
    expected: Option<u32>,
    probe: Box<dyn ParentProbe>,
}

impl ParentGuard {
    pub fn new(expected: Option<u32>, probe: Box<dyn ParentProbe>) -> Self {
        Self { expected, probe }
    }

    pub fn expected(&self) -> Option<u32> {
        self.expected
    }

    pub fn verify(&self) -> Result<(), ParentMismatch> {
        let Some(expected) = self.expected else {
            return Ok(());
        };
        let actual = self.probe.parent_pid();
        if actual == expected {
            Ok(())
        } else {
            Err(ParentMismatch { expected, actual })
        }
    }
}
