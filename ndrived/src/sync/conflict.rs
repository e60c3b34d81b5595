/// Which side wins when the user resolves a conflicted row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    UseLocal,
    UseRemote,
}

impl Resolution {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "local" | "use_local" => Some(Resolution::UseLocal),
            "remote" | "use_remote" => Some(Resolution::UseRemote),
            _ => None,
        }
    }
}

/// `report.pdf` with `n = 2` becomes `report (2).pdf`.
pub fn numbered_name(name: &str, n: u32) -> String {
    match name.rfind('.') {
        Some(idx) if idx > 0 => format!("{} ({n}){}", &name[..idx], &name[idx..]),
        _ => format!("{name} ({n})"),
    }
}

/// First of `name`, `name (1)`, `name (2)`... that `is_taken` rejects.
/// Folder names are numbered as a whole.
pub fn dedup_name(name: &str, folderish: bool, is_taken: impl Fn(&str) -> bool) -> String {
    if !is_taken(name) {
        return name.to_string();
    }
    let mut n = 1;
    loop {
        let candidate = if folderish {
            format!("{name} ({n})")
        } else {
            numbered_name(name, n)
        };
        if !is_taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}
