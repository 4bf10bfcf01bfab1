extern crate ffmpeg_next as ffmpeg;

use std::collections::HashMap;

use ffmpeg::Dictionary as AvDictionary;

/// A wrapper type for free-form ffmpeg option dictionaries. Keys are
/// evaluated by the backend at open time; unknown keys are reported by
/// libav* in the log, they do not fail the open.
#[derive(Debug, Clone)]
pub struct Options(AvDictionary<'static>);

impl Options {
    /// Create an empty option set.
    pub fn new() -> Self {
        Self(AvDictionary::new())
    }

    /// Set a single option.
    pub fn set(&mut self, key: &str, value: &str) {
        self.0.set(key, value);
    }

    /// Creates options such that ffmpeg will prefer TCP transport when
    /// reading an RTSP stream (over the default UDP transport).
    ///
    /// This sets `rtsp_transport` to `tcp`.
    pub fn preset_rtsp_transport_tcp() -> Self {
        let mut opts = AvDictionary::new();
        opts.set("rtsp_transport", "tcp");

        Self(opts)
    }

    /// Creates options such that ffmpeg is instructed to fragment output and
    /// mux to a fragmented mp4 container.
    ///
    /// The muxer output will not have a header and each fragment carries
    /// enough metadata to be streamed without one.
    pub fn preset_fragmented_mov() -> Self {
        let mut opts = AvDictionary::new();
        opts.set(
            "movflags",
            "faststart+frag_keyframe+frag_custom+empty_moov+omit_tfhd_offset",
        );

        Self(opts)
    }

    /// Whether any options are set at all.
    pub fn is_empty(&self) -> bool {
        self.0.iter().next().is_none()
    }

    /// Convert back to an ffmpeg native dictionary, which can be used with
    /// `ffmpeg_next` functions.
    pub(crate) fn to_dict(&self) -> AvDictionary {
        self.0.clone()
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}

impl From<HashMap<String, String>> for Options {
    fn from(item: HashMap<String, String>) -> Self {
        let mut opts = AvDictionary::new();
        for (k, v) in item {
            opts.set(&k, &v);
        }

        Self(opts)
    }
}

impl From<Options> for HashMap<String, String> {
    fn from(item: Options) -> Self {
        item.0
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

unsafe impl Send for Options {}
unsafe impl Sync for Options {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_through_hashmap() {
        let mut map = HashMap::new();
        map.insert("analyzeduration".to_string(), "1000000".to_string());
        map.insert("probesize".to_string(), "65536".to_string());
        let opts: Options = map.clone().into();
        assert!(!opts.is_empty());
        let back: HashMap<String, String> = opts.into();
        assert_eq!(back, map);
    }

    #[test]
    fn empty_by_default() {
        assert!(Options::default().is_empty());
    }
}
