//! Natural-language summaries of capped query results. The summary is
//! produced from the bounded result set only, never from unbounded raw
//! data, which keeps both latency and context cost bounded.

use std::collections::BTreeMap;

const DISPLAY_LIMIT: usize = 10;

pub fn summarize(
    columns: &[String],
    preview: &[BTreeMap<String, String>],
    total: usize,
    truncated: bool,
) -> String {
    if total == 0 {
        return "没有查询到相关记录。".to_owned();
    }

    // Single cell: a count or an aggregate; answer with the number alone.
    if total == 1 && columns.len() == 1 && preview.len() == 1 {
        let value = preview[0].values().next().cloned().unwrap_or_default();
        return format!("查询结果：{value}");
    }

    let mut out = format!("查询结果（共 {total} 条）：");
    for (i, row) in preview.iter().take(DISPLAY_LIMIT).enumerate() {
        let line = columns
            .iter()
            .filter_map(|col| {
                let value = row.get(col)?;
                (!value.is_empty()).then(|| format!("{col}: {value}"))
            })
            .collect::<Vec<_>>()
            .join(" | ");
        out.push_str(&format!("\n{}. {line}", i + 1));
    }
    if total > DISPLAY_LIMIT {
        out.push_str(&format!("\n……另有 {} 条未显示", total - DISPLAY_LIMIT));
    }
    if truncated {
        out.push_str("\n（结果超出查询上限，以上仅为前一部分）");
    }
    out
}
