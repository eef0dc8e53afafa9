/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Service advertising is done by an external mDNS collaborator; this
//! module only builds the two TXT record sets and defines the seam the
//! session layer talks through.

use std::fmt::Write;

pub const STATUS_FLAG_DEVICE_SUPPORTS_RELAY: u32 = 1 << 11;

/// Inputs the record sets are derived from.
#[derive(Debug, Clone)]
pub struct AdvertisingState {
    pub device_id: String,
    pub public_key_hex: String,
    pub pi_uuid: String,
    pub model: String,
    pub firmware_version: String,
    pub features: u64,
    pub status_flags: u32,
    pub group_uuid: Option<String>,
    pub group_contains_group_leader: bool,
}

impl AdvertisingState {
    fn features_string(&self) -> String {
        format!(
            "0x{:X},0x{:X}",
            self.features & 0xFFFF_FFFF,
            (self.features >> 32) & 0xFFFF_FFFF
        )
    }

    /// The `_airplay._tcp` record set.
    pub fn primary_records(&self) -> Vec<String> {
        let mut records = vec![
            "cn=0,1".to_owned(),
            "da=true".to_owned(),
            "et=0,4".to_owned(),
            format!("ft={}", self.features_string()),
            format!("fv={}", self.firmware_version),
            "md=2".to_owned(),
            format!("am={}", self.model),
            format!("sf=0x{:X}", self.status_flags),
            "tp=UDP".to_owned(),
            "vn=65537".to_owned(),
            "vs=366.0".to_owned(),
        ];
        let mut pk = String::with_capacity(3 + self.public_key_hex.len());
        write!(pk, "pk={}", self.public_key_hex).expect("writing to a string cannot fail");
        records.push(pk);
        records.push(format!("pi={}", self.pi_uuid));
        records
    }

    /// The secondary (RAOP-style) record set.
    pub fn secondary_records(&self) -> Vec<String> {
        let mut records = vec![
            "srcvers=366.0".to_owned(),
            format!("deviceid={}", self.device_id),
            format!("features={}", self.features_string()),
            format!("flags=0x{:X}", self.status_flags),
            "protovers=1.1".to_owned(),
            "acl=0".to_owned(),
            "rsf=0x0".to_owned(),
            format!("fv={}", self.firmware_version),
            format!("model={}", self.model),
            format!("pi={}", self.pi_uuid),
            format!(
                "gid={}",
                self.group_uuid.as_deref().unwrap_or(&self.pi_uuid)
            ),
        ];
        if self.group_contains_group_leader {
            records.push("gcgl=1".to_owned());
            records.push("isGroupLeader=0".to_owned());
        } else {
            records.push("gcgl=0".to_owned());
        }
        records
    }
}

/// The external advertiser. Implementations forward to whatever mDNS
/// responder the host runs.
pub trait Advertiser: Send + Sync {
    fn register(&self, primary: &[String], secondary: &[String]);
    fn update(&self, primary: &[String], secondary: &[String]);
    fn unregister(&self);
}

/// Used when no responder is wired up; advertising calls become log lines.
pub struct NullAdvertiser;

impl Advertiser for NullAdvertiser {
    fn register(&self, primary: &[String], secondary: &[String]) {
        tracing::debug!(
            "mDNS register: {} primary, {} secondary records.",
            primary.len(),
            secondary.len()
        );
    }

    fn update(&self, _primary: &[String], secondary: &[String]) {
        tracing::debug!("mDNS update: {} secondary records.", secondary.len());
    }

    fn unregister(&self) {
        tracing::debug!("mDNS unregister.");
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn state() -> AdvertisingState {
        AdvertisingState {
            device_id: "11:22:33:44:55:66".to_owned(),
            public_key_hex: "ab".repeat(32),
            pi_uuid: "2e388006-13ba-4041-9a67-25dd4a43d536".to_owned(),
            model: "airplay2-rx".to_owned(),
            firmware_version: "0.1.0".to_owned(),
            features: 0x1C340405F_4A00u64,
            status_flags: 0x4,
            group_uuid: None,
            group_contains_group_leader: false,
        }
    }

    #[test]
    fn primary_records_carry_required_keys() {
        let records = state().primary_records();
        for key in ["ft=", "fv=", "pk=", "pi=", "am=", "sf="] {
            assert!(
                records.iter().any(|r| r.starts_with(key)),
                "missing {key} in {records:?}"
            );
        }
    }

    #[test]
    fn features_split_into_two_32_bit_words() {
        let mut s = state();
        s.features = 0x0000_0001_C034_0405;
        assert_eq!(s.features_string(), "0xC0340405,0x1");
    }

    #[test]
    fn secondary_records_fall_back_to_pi_for_gid() {
        let s = state();
        let records = s.secondary_records();
        assert!(records.contains(&format!("gid={}", s.pi_uuid)));

        let mut grouped = state();
        grouped.group_uuid = Some("d9f45a1c".to_owned());
        grouped.group_contains_group_leader = true;
        let records = grouped.secondary_records();
        assert!(records.contains(&"gid=d9f45a1c".to_owned()));
        assert!(records.contains(&"gcgl=1".to_owned()));
    }

    #[test]
    fn relay_bit_shows_in_status_flags() {
        let mut s = state();
        s.status_flags |= STATUS_FLAG_DEVICE_SUPPORTS_RELAY;
        assert!(s.primary_records().iter().any(|r| r == "sf=0x804"));
    }
}
