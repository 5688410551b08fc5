//! Lock strengths and their compatibility table

use std::fmt;

/// Lock strength, weakest to strongest.
///
/// `Update` is a transient strength that only exists while a Read lock is being
/// converted to Write; callers never request it directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    Null = 0,
    Read = 1,
    Update = 2,
    Write = 3,
}

/// `COMPATIBLE[current][request]`
const COMPATIBLE: [[bool; 4]; 4] = [
    //  Null   Read   Update Write
    [true, true, false, true],     // Null
    [true, true, false, false],    // Read
    [false, false, false, false],  // Update
    [true, false, false, false],   // Write
];

impl LockMode {
    /// All strengths, weakest first
    pub const ALL: [LockMode; 4] = [
        LockMode::Null,
        LockMode::Read,
        LockMode::Update,
        LockMode::Write,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Can a request for `self` be granted while `current` is the strongest held mode?
    pub fn is_compatible_with(self, current: LockMode) -> bool {
        COMPATIBLE[current.index()][self.index()]
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockMode::Null => "Null",
            LockMode::Read => "Read",
            LockMode::Update => "Update",
            LockMode::Write => "Write",
        };
        write!(f, "{}", name)
    }
}
