//! Snapshot paths of common IP camera vendors, probed when nothing better is known.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VendorPattern {
    pub name: &'static str,
    /// Lowercase fragments that suggest this vendor when found in the target's
    /// hostname, name, stream path or previously resolved URL.
    pub hints: &'static [&'static str],
    pub snapshot_paths: &'static [&'static str],
}

pub const VENDOR_PATTERNS: &[VendorPattern] = &[
    VendorPattern {
        name: "hikvision",
        hints: &["hikvision", "hik", "isapi", "streaming/channels"],
        snapshot_paths: &[
            "/ISAPI/Streaming/channels/101/picture",
            "/ISAPI/Streaming/channels/1/picture",
        ],
    },
    VendorPattern {
        name: "reolink",
        hints: &["reolink", "h264preview", "preview_01", "api.cgi"],
        snapshot_paths: &["/cgi-bin/api.cgi?cmd=Snap&channel=0&rs=nexuswatch"],
    },
    VendorPattern {
        name: "dahua",
        hints: &["dahua", "amcrest", "realmonitor", "snapshot.cgi"],
        snapshot_paths: &["/cgi-bin/snapshot.cgi", "/cgi-bin/snapshot.cgi?channel=1"],
    },
    VendorPattern {
        name: "axis",
        hints: &["axis", "axis-cgi", "axis-media"],
        snapshot_paths: &["/axis-cgi/jpg/image.cgi"],
    },
    VendorPattern {
        name: "foscam",
        hints: &["foscam", "videomain", "cgiproxy"],
        snapshot_paths: &["/cgi-bin/CGIProxy.fcgi?cmd=snapPicture2"],
    },
    VendorPattern {
        name: "generic",
        hints: &[],
        snapshot_paths: &["/snapshot.jpg", "/snap.jpg", "/image.jpg", "/cgi-bin/snapshot.jpg"],
    },
];

/// Orders `table` so vendors hinted by `haystack` come first, keeping table
/// order otherwise.
pub fn rank_vendors<'a>(haystack: &str, table: &'a [VendorPattern]) -> Vec<&'a VendorPattern> {
    let haystack = haystack.to_lowercase();
    let (mut hinted, rest): (Vec<_>, Vec<_>) = table
        .iter()
        .partition(|v| v.hints.iter().any(|h| haystack.contains(h)));
    hinted.extend(rest);
    hinted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hinted_vendor_goes_first() {
        let ranked = rank_vendors("rtsp://10.0.0.5:554/h264Preview_01_main", VENDOR_PATTERNS);
        assert_eq!(ranked[0].name, "reolink");
        assert_eq!(ranked.len(), VENDOR_PATTERNS.len());
    }

    #[test]
    fn test_no_hint_keeps_table_order() {
        let ranked = rank_vendors("10.0.0.5", VENDOR_PATTERNS);
        let names: Vec<_> = ranked.iter().map(|v| v.name).collect();
        let expected: Vec<_> = VENDOR_PATTERNS.iter().map(|v| v.name).collect();
        assert_eq!(names, expected);
    }
}
