use std::fmt;

/// store 诊断报告（`dirstore info` 输出）
#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    /// 工作目录；纯内存 store 为 None
    pub working_dir: Option<String>,
    /// 主表
    pub master: MasterStats,
    /// RDN 索引配对数（= 有位置的条目数）
    pub rdn_pairs: usize,
    /// presence 索引配对数
    pub presence_pairs: usize,
    /// 属性索引，按名字排序
    pub indexes: Vec<IndexStats>,
}

#[derive(Clone, Debug, Default)]
pub struct MasterStats {
    pub entry_count: usize,
    /// 最近一次发出的 id
    pub current_id: u64,
    pub property_count: usize,
    /// master.wal 当前字节数
    pub journal_bytes: u64,
}

#[derive(Clone, Debug, Default)]
pub struct IndexStats {
    pub attribute: String,
    pub rule: String,
    /// 不同的归一化值个数
    pub distinct_values: usize,
    /// (值, id) 配对数
    pub pairs: usize,
    pub journal_bytes: u64,
}

impl StoreStats {
    /// 所有日志文件字节数之和
    pub fn total_journal_bytes(&self) -> u64 {
        self.master.journal_bytes + self.indexes.iter().map(|i| i.journal_bytes).sum::<u64>()
    }
}

fn human_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

impl fmt::Display for StoreStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "╔══════════════════════════════════════════════════╗")?;
        writeln!(f, "║           dirstore Store Report                  ║")?;
        writeln!(f, "╠══════════════════════════════════════════════════╣")?;
        writeln!(
            f,
            "║ Location: {:>38} ║",
            self.working_dir.as_deref().unwrap_or("(in memory)")
        )?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(f, "║ Master:                                          ║")?;
        writeln!(
            f,
            "║   entries:      {:>10}                       ║",
            self.master.entry_count
        )?;
        writeln!(
            f,
            "║   current id:   {:>10}                       ║",
            self.master.current_id
        )?;
        writeln!(
            f,
            "║   properties:   {:>10}                       ║",
            self.master.property_count
        )?;
        writeln!(
            f,
            "║   journal:      {:>10}                       ║",
            human_bytes(self.master.journal_bytes)
        )?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(f, "║ System indexes:                                  ║")?;
        writeln!(
            f,
            "║   rdn pairs:    {:>10}                       ║",
            self.rdn_pairs
        )?;
        writeln!(
            f,
            "║   presence:     {:>10}                       ║",
            self.presence_pairs
        )?;
        if !self.indexes.is_empty() {
            writeln!(f, "╠──────────────────────────────────────────────────╣")?;
            writeln!(f, "║ Attribute indexes:                               ║")?;
            for idx in &self.indexes {
                writeln!(
                    f,
                    "║   {:<12} {:>8} keys {:>8} pairs ({:>10}) ║",
                    idx.attribute,
                    idx.distinct_values,
                    idx.pairs,
                    human_bytes(idx.journal_bytes)
                )?;
            }
        }
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(
            f,
            "║ Journals total: {:>32} ║",
            human_bytes(self.total_journal_bytes())
        )?;
        writeln!(f, "╚══════════════════════════════════════════════════╝")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_bytes_units() {
        assert_eq!(human_bytes(12), "12 B");
        assert_eq!(human_bytes(2048), "2.00 KB");
        assert_eq!(human_bytes(3 * 1024 * 1024), "3.00 MB");
    }

    #[test]
    fn report_lists_indexes_and_totals() {
        let stats = StoreStats {
            working_dir: None,
            master: MasterStats {
                entry_count: 3,
                current_id: 3,
                property_count: 1,
                journal_bytes: 100,
            },
            rdn_pairs: 3,
            presence_pairs: 7,
            indexes: vec![IndexStats {
                attribute: "cn".into(),
                rule: "caseIgnoreMatch".into(),
                distinct_values: 3,
                pairs: 3,
                journal_bytes: 28,
            }],
        };
        assert_eq!(stats.total_journal_bytes(), 128);
        let text = stats.to_string();
        assert!(text.contains("(in memory)"));
        assert!(text.contains("cn"));
        assert!(text.contains("128 B"));
    }
}
