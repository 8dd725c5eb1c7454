/// Indentation-aware OpenCL C text builder.
#[derive(Debug, Default)]
pub(crate) struct KernelSource {
    text: String,
    indent: usize,
}

impl KernelSource {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn line(&mut self, line: &str) {
        if line.is_empty() {
            self.text.push('\n');
            return;
        }
        for _ in 0..self.indent {
            self.text.push_str("  ");
        }
        self.text.push_str(line);
        self.text.push('\n');
    }

    /// Writes `header` followed by an opening brace and indents. An empty
    /// header opens a bare scope.
    pub(crate) fn open(&mut self, header: &str) {
        if !header.is_empty() {
            self.line(header);
        }
        self.line("{");
        self.indent += 1;
    }

    pub(crate) fn close(&mut self) {
        self.indent = self.indent.saturating_sub(1);
        self.line("}");
    }

    /// Appends a multi-line block, stripping its common leading whitespace
    /// and surrounding blank lines before re-indenting it.
    pub(crate) fn block(&mut self, block: &str) {
        let mut lines: Vec<&str> = block.split('\n').collect();
        if matches!(lines.first(), Some(line) if line.trim().is_empty()) {
            lines.remove(0);
        }
        if matches!(lines.last(), Some(line) if line.trim().is_empty()) {
            lines.pop();
        }
        let min_indent = lines
            .iter()
            .filter(|line| !line.trim().is_empty())
            .map(|line| line.chars().take_while(|c| *c == ' ' || *c == '\t').count())
            .min()
            .unwrap_or(0);
        for line in lines {
            if line.trim().is_empty() {
                self.line("");
            } else {
                self.line(line.get(min_indent..).unwrap_or(line).trim_end());
            }
        }
    }

    pub(crate) fn finish(self) -> String {
        self.text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_is_dedented_and_reindented() {
        let mut source = KernelSource::new();
        source.open("__kernel void k()");
        source.block(
            r#"
                int a = 0;
                if (a)
                  a += 1;
            "#,
        );
        source.close();
        assert_eq!(
            source.finish(),
            "__kernel void k()\n{\n  int a = 0;\n  if (a)\n    a += 1;\n}\n"
        );
    }
}
