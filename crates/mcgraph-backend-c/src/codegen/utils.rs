use mcgraph::ir::VariableId;
use mcgraph::settings::Precision;

pub(super) fn push_line(module: &mut String, indent: usize, line: &str) {
    push_block(module, indent, line);
}

/// Appends `block` dedented to its least-indented line, then indented by `indent` levels.
pub(super) fn push_block(module: &mut String, indent: usize, block: &str) {
    if block.is_empty() {
        return;
    }
    let pad = "  ".repeat(indent);
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
        .map(|line| line.chars().take_while(|c| *c == ' ').count())
        .min()
        .unwrap_or(0);

    for line in lines {
        let trimmed = line.get(min_indent..).unwrap_or("").trim_end();
        if trimmed.is_empty() {
            module.push('\n');
            continue;
        }
        module.push_str(&pad);
        module.push_str(trimmed);
        module.push('\n');
    }
}

pub(super) fn real_type(precision: Precision) -> &'static str {
    match precision {
        Precision::Single => "float",
        Precision::Double => "double",
    }
}

pub(super) fn local_name(id: VariableId) -> String {
    format!("v{id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_block_dedents_and_reindents() {
        let mut module = String::new();
        push_block(
            &mut module,
            1,
            r#"
            if (x) {
              y = 1;
            }
            "#,
        );
        assert_eq!(module, "  if (x) {\n    y = 1;\n  }\n");
    }

    #[test]
    fn push_line_indents_single_lines() {
        let mut module = String::new();
        push_line(&mut module, 2, "return 0;");
        assert_eq!(module, "    return 0;\n");
    }
}
