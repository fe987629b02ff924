//! Line diff for previews of config edits

/// Render a unified-style line diff between `before` and `after`.
///
/// `before = None` means the file does not exist yet.
pub fn line_diff(label: &str, before: Option<&str>, after: &str) -> String {
    let old: Vec<&str> = before.map(|b| b.lines().collect()).unwrap_or_default();
    let new: Vec<&str> = after.lines().collect();

    let mut out = String::new();
    out.push_str(&format!(
        "--- {}\n",
        if before.is_some() { format!("a/{label}") } else { "/dev/null".to_string() }
    ));
    out.push_str(&format!("+++ b/{label}\n"));

    // LCS table, configs are small
    let (n, m) = (old.len(), new.len());
    let mut lcs = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if old[i] == new[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old[i] == new[j] {
            out.push_str(&format!(" {}\n", old[i]));
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            out.push_str(&format!("-{}\n", old[i]));
            i += 1;
        } else {
            out.push_str(&format!("+{}\n", new[j]));
            j += 1;
        }
    }
    for line in &old[i..] {
        out.push_str(&format!("-{line}\n"));
    }
    for line in &new[j..] {
        out.push_str(&format!("+{line}\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_file_is_all_additions() {
        let diff = line_diff("config.json", None, "{\n}");
        assert!(diff.starts_with("--- /dev/null\n+++ b/config.json\n"));
        assert!(diff.contains("+{\n+}\n"));
    }

    #[test]
    fn test_changed_line() {
        let before = "{\n\t\"credsStore\": \"secretservice\"\n}";
        let after = "{\n\t\"credsStore\": \"pass\"\n}";
        let diff = line_diff("config.json", Some(before), after);
        assert!(diff.contains("-\t\"credsStore\": \"secretservice\"\n"));
        assert!(diff.contains("+\t\"credsStore\": \"pass\"\n"));
        assert!(diff.contains(" {\n"));
    }
}
