use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Which geolocation database edition a file carries. The edition caps
/// which record fields are populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edition {
    Country,
    Region,
    City,
    Org,
}

impl Edition {
    fn describe(self) -> &'static str {
        match self {
            Edition::Country => "country edition",
            Edition::Region => "region edition",
            Edition::City => "city edition",
            Edition::Org => "organization edition",
        }
    }
}

/// One geolocation answer. Fields beyond the edition's scope are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeoRecord {
    pub country_code: String,
    pub country_code3: String,
    pub country_name: String,
    pub continent_code: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub org: Option<String>,
}

struct Range {
    start: u32,
    end: u32,
    record: GeoRecord,
}

/// Read-only geolocation database: sorted IPv4 ranges loaded from a text
/// file, one range per line as
/// `start,end,cc,cc3,country[,continent[,region[,city[,org]]]]`
/// with addresses in dotted-quad form. Lookups are stateless and never
/// touch the file again after open.
pub struct GeoDb {
    path: PathBuf,
    edition: Edition,
    ranges: Vec<Range>,
}

fn parse_addr(text: &str) -> Result<u32> {
    let ip: Ipv4Addr = text.trim().parse().map_err(|_| Error::Corrupted)?;
    Ok(u32::from(ip))
}

fn parse_line(line: &str, edition: Edition) -> Result<Range> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < 5 {
        return Err(Error::Corrupted);
    }
    let opt = |i: usize| fields.get(i).filter(|s| !s.is_empty()).map(|s| s.to_string());
    let record = GeoRecord {
        country_code: fields[2].to_string(),
        country_code3: fields[3].to_string(),
        country_name: fields[4].to_string(),
        continent_code: opt(5),
        region: if edition == Edition::Country { None } else { opt(6) },
        city: if matches!(edition, Edition::City | Edition::Org) { opt(7) } else { None },
        org: if edition == Edition::Org { opt(8) } else { None },
    };
    let start = parse_addr(fields[0])?;
    let end = parse_addr(fields[1])?;
    if start > end {
        return Err(Error::Corrupted);
    }
    Ok(Range { start, end, record })
}

/// Resolve a hostname or IP literal to one IPv4 address.
fn resolve(host: &str) -> Result<Ipv4Addr> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    let addrs = (host, 0u16).to_socket_addrs().map_err(|_| Error::InvalidHost)?;
    for addr in addrs {
        if let IpAddr::V4(v4) = addr.ip() {
            return Ok(v4);
        }
    }
    Err(Error::InvalidHost)
}

impl GeoDb {
    pub fn open(path: &Path, edition: Edition) -> Result<GeoDb> {
        let reader = BufReader::new(File::open(path)?);
        let mut ranges = Vec::new();
        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            ranges.push(parse_line(line, edition)?);
        }
        ranges.sort_by_key(|r| r.start);
        log::debug!(
            "loaded geo database {} ({}, {} ranges)",
            path.display(),
            edition.describe(),
            ranges.len()
        );
        Ok(GeoDb {
            path: path.to_path_buf(),
            edition,
            ranges,
        })
    }

    pub fn edition(&self) -> Edition {
        self.edition
    }

    /// Human-readable description of the loaded database.
    pub fn database_info(&self) -> String {
        format!(
            "{} ({}, {} ranges)",
            self.path.display(),
            self.edition.describe(),
            self.ranges.len()
        )
    }

    /// Look up a hostname or IPv4 literal. `InvalidHost` when it cannot be
    /// resolved, `NotFound` when no range covers the address.
    pub fn record_by_name(&self, host: &str) -> Result<GeoRecord> {
        let addr = u32::from(resolve(host)?);
        let idx = self.ranges.partition_point(|r| r.start <= addr);
        if idx == 0 {
            return Err(Error::NotFound);
        }
        let range = &self.ranges[idx - 1];
        if addr > range.end {
            return Err(Error::NotFound);
        }
        Ok(range.record.clone())
    }

    pub fn country_code_by_name(&self, host: &str) -> Result<String> {
        Ok(self.record_by_name(host)?.country_code)
    }

    pub fn country_code3_by_name(&self, host: &str) -> Result<String> {
        Ok(self.record_by_name(host)?.country_code3)
    }

    pub fn country_name_by_name(&self, host: &str) -> Result<String> {
        Ok(self.record_by_name(host)?.country_name)
    }

    pub fn continent_code_by_name(&self, host: &str) -> Result<String> {
        self.record_by_name(host)?
            .continent_code
            .ok_or(Error::NotFound)
    }

    pub fn region_by_name(&self, host: &str) -> Result<String> {
        self.record_by_name(host)?.region.ok_or(Error::NotFound)
    }

    pub fn org_by_name(&self, host: &str) -> Result<String> {
        self.record_by_name(host)?.org.ok_or(Error::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_db(edition: Edition) -> (tempfile::TempDir, GeoDb) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("geo.csv");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "# test ranges").unwrap();
        writeln!(
            f,
            "10.0.0.0,10.0.0.255,US,USA,United States,NA,California,Fresno,ExampleNet"
        )
        .unwrap();
        writeln!(f, "10.0.2.0,10.0.2.255,FR,FRA,France,EU,,,").unwrap();
        let db = GeoDb::open(&path, edition).unwrap();
        (dir, db)
    }

    #[test]
    fn lookup_by_ip_literal() {
        let (_dir, db) = sample_db(Edition::Org);
        let record = db.record_by_name("10.0.0.42").unwrap();
        assert_eq!(record.country_code, "US");
        assert_eq!(record.country_code3, "USA");
        assert_eq!(record.country_name, "United States");
        assert_eq!(record.continent_code.as_deref(), Some("NA"));
        assert_eq!(record.region.as_deref(), Some("California"));
        assert_eq!(record.city.as_deref(), Some("Fresno"));
        assert_eq!(record.org.as_deref(), Some("ExampleNet"));
    }

    #[test]
    fn gap_between_ranges_is_not_found() {
        let (_dir, db) = sample_db(Edition::Country);
        assert!(matches!(db.record_by_name("10.0.1.7"), Err(Error::NotFound)));
        assert!(matches!(db.record_by_name("9.255.255.255"), Err(Error::NotFound)));
        assert_eq!(db.country_code_by_name("10.0.2.1").unwrap(), "FR");
    }

    #[test]
    fn country_edition_hides_narrow_fields() {
        let (_dir, db) = sample_db(Edition::Country);
        let record = db.record_by_name("10.0.0.1").unwrap();
        assert_eq!(record.region, None);
        assert_eq!(record.city, None);
        assert_eq!(record.org, None);
        assert!(matches!(db.region_by_name("10.0.0.1"), Err(Error::NotFound)));
    }

    #[test]
    fn unresolvable_host_is_rejected() {
        let (_dir, db) = sample_db(Edition::Country);
        assert!(matches!(
            db.record_by_name("no-such-host.invalid"),
            Err(Error::InvalidHost)
        ));
    }

    #[test]
    fn malformed_line_is_corrupted() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("geo.csv");
        std::fs::write(&path, "10.0.0.0,banana,US\n").unwrap();
        assert!(matches!(
            GeoDb::open(&path, Edition::Country),
            Err(Error::Corrupted)
        ));
    }
}
