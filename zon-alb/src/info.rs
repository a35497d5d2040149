use crate::{alb::Alb, helpers::mac_to_str};

/// Column aligned text table
pub struct InfoTable {
    rows: Vec<Vec<String>>,
    sizes: Vec<usize>,
}

impl InfoTable {
    pub fn new(header: Vec<&str>) -> Self {
        let header = header.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let sizes = header.iter().map(|s| s.len()).collect();
        Self {
            rows: vec![header],
            sizes,
        }
    }

    pub fn push_row(&mut self, mut row: Vec<String>) {
        row.resize(self.sizes.len(), String::new());
        for (i, s) in row.iter().enumerate() {
            self.sizes[i] = self.sizes[i].max(s.len());
        }
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len() - 1
    }

    pub(crate) fn lines(&self) -> Vec<String> {
        let mut lines = vec![];
        let hdr_len = self.sizes.iter().map(|s| s + 1).sum::<usize>().saturating_sub(1);

        for (i, row) in self.rows.iter().enumerate() {
            let line = self
                .sizes
                .iter()
                .enumerate()
                .map(|(i, &size)| format!("{0:<1$}", row[i], size + 1))
                .collect::<String>();
            let line = line.trim_end().to_string();
            lines.push(line);
            if i == 0 {
                lines.push(format!("{0:-<1$}", '-', hdr_len));
            }
        }
        if self.len() == 0 {
            lines.push(String::from("no entries"));
        } else {
            lines.push(format!("{0:-<1$}", '-', hdr_len));
        }
        lines
    }

    pub fn print(&self, title: &str) {
        if !title.is_empty() {
            println!("\r\n{title}\r\n{0:-<1$}", "-", title.len());
        } else {
            println!();
        }
        for line in self.lines() {
            println!("{}", line);
        }
    }
}

pub fn print_links(alb: &Alb) {
    let active = alb.active().map(|l| l.id());
    let mut table = InfoTable::new(vec!["id", "name", "speed", "mac", "perm_mac", "flags", "tlb_load"]);
    for link in alb.link_list() {
        let mut flags = format!("{:?}", link.flags());
        if active == Some(link.id()) {
            flags.push_str(" | PRIMARY");
        }
        let load = alb
            .tlb()
            .link_info(link.id())
            .map_or(String::from("n/a"), |info| info.load.to_string());
        table.push_row(vec![
            link.id().to_string(),
            link.name().to_string(),
            link.speed().to_string(),
            mac_to_str(&link.hw_addr()),
            mac_to_str(&link.perm_hw_addr()),
            flags,
            load,
        ]);
    }
    table.print(&format!("{} links", alb.name()));
}

pub fn print_tlb(alb: &Alb) {
    let mut table = InfoTable::new(vec!["hash", "link", "tx_bytes", "load_history"]);
    for entry in alb.tlb().entries() {
        let link = alb
            .find_link(entry.link)
            .map_or(entry.link.to_string(), |l| l.name().to_string());
        table.push_row(vec![
            entry.index.to_string(),
            link,
            entry.tx_bytes.to_string(),
            entry.load_history.to_string(),
        ]);
    }
    table.print(&format!("{} tlb entries", alb.name()));
}

pub fn print_rlb(alb: &Alb) {
    let Some(rlb) = alb.rlb() else {
        log::info!("[rlb] receive balancing is disabled on {}", alb.name());
        return;
    };
    let mut table = InfoTable::new(vec!["hash", "link", "ip_src", "ip_dst", "mac_dst", "vlan", "ntt"]);
    for (index, client) in rlb.clients() {
        let link = client.link.map_or(String::from("none"), |id| {
            alb.find_link(id)
                .map_or(id.to_string(), |l| l.name().to_string())
        });
        table.push_row(vec![
            index.to_string(),
            link,
            client.ip_src.to_string(),
            client.ip_dst.to_string(),
            mac_to_str(&client.mac_dst),
            client.vlan_id.map_or(String::from("-"), |v| v.to_string()),
            client.ntt.to_string(),
        ]);
    }
    table.print(&format!("{} rlb clients", alb.name()));
}
