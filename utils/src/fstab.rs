use std::fmt::{Display, Write as _};

/// Helper to format a single field of an fstab(5) line.
#[derive(Debug)]
pub struct FstabFieldDisplay<'a> {
    field: &'a str,
}

impl<'a> Display for FstabFieldDisplay<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.field.chars().any(needs_escape) {
            return f.write_str(self.field);
        }
        for c in self.field.chars() {
            if needs_escape(c) {
                write!(f, "\\{:03o}", c as u32)?;
            } else {
                f.write_char(c)?;
            }
        }
        Ok(())
    }
}

impl<'a> FstabFieldDisplay<'a> {
    /// Given a field value, octal-escape it the way libmount expects so that
    /// embedded whitespace does not split the field. A value without
    /// whitespace or backslashes is rendered unchanged.
    pub fn new(field: &'a str) -> FstabFieldDisplay<'a> {
        FstabFieldDisplay { field }
    }
}

fn needs_escape(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\n' | '\\')
}

/// Render fstab fields as one tab-separated line.
pub fn fstab_line<'a>(fields: impl IntoIterator<Item = &'a str>) -> String {
    let mut r = String::new();
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            r.push('\t');
        }
        // Writing into a String cannot fail
        let _ = write!(r, "{}", FstabFieldDisplay::new(field));
    }
    r
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unescaped() {
        for v in ["", "tmpfs", "/run/overlay", "defaults,size=25%", "LABEL=COS_OEM"] {
            assert_eq!(v, format!("{}", FstabFieldDisplay::new(v)));
        }
    }

    #[test]
    fn test_escaped() {
        let cases = [
            (" ", "\\040"),
            ("/some/path with spaces", "/some/path\\040with\\040spaces"),
            ("a\tb", "a\\011b"),
            ("/dev/disk/by-label/x\\x20y", "/dev/disk/by-label/x\\134x20y"),
        ];
        for (v, escaped) in cases {
            assert_eq!(escaped, format!("{}", FstabFieldDisplay::new(v)));
        }
    }

    #[test]
    fn test_line() {
        similar_asserts::assert_eq!(
            fstab_line(["tmpfs", "/run/overlay", "tmpfs", "defaults,size=25%"]),
            "tmpfs\t/run/overlay\ttmpfs\tdefaults,size=25%"
        );
        assert_eq!(fstab_line(["/my dir", "/x"]), "/my\\040dir\t/x");
    }
}
