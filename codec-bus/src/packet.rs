use bytes::Bytes;

/// Per-buffer flags, numerically compatible with the usual hardware codec
/// buffer flag bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferFlags(u32);

impl BufferFlags {
    pub const NONE: BufferFlags = BufferFlags(0);
    pub const KEY_FRAME: BufferFlags = BufferFlags(1);
    pub const CODEC_CONFIG: BufferFlags = BufferFlags(2);
    pub const END_OF_STREAM: BufferFlags = BufferFlags(4);

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn contains(&self, other: BufferFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_key(&self) -> bool {
        self.contains(Self::KEY_FRAME)
    }

    pub fn is_eos(&self) -> bool {
        self.contains(Self::END_OF_STREAM)
    }
}

impl std::ops::BitOr for BufferFlags {
    type Output = BufferFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        BufferFlags(self.0 | rhs.0)
    }
}

/// Description of one sample as read from a demuxer or written to a muxer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleInfo {
    pub size: usize,
    pub pts_us: i64,
    pub flags: BufferFlags,
}

impl SampleInfo {
    pub fn new(size: usize, pts_us: i64, flags: BufferFlags) -> Self {
        Self {
            size,
            pts_us,
            flags,
        }
    }
}

/// One compressed access unit. A `None` payload is an explicit end marker.
#[derive(Debug, Clone, Default)]
pub struct EncodedUnit {
    data: Option<Bytes>,
    pts_us: i64,
    flags: BufferFlags,
}

impl EncodedUnit {
    pub fn new(data: Bytes, pts_us: i64, flags: BufferFlags) -> Self {
        Self {
            data: Some(data),
            pts_us,
            flags,
        }
    }

    pub fn end_of_stream() -> Self {
        Self {
            data: None,
            pts_us: 0,
            flags: BufferFlags::END_OF_STREAM,
        }
    }

    pub fn data(&self) -> Option<&Bytes> {
        self.data.as_ref()
    }

    pub fn pts_us(&self) -> i64 {
        self.pts_us
    }

    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    pub fn size(&self) -> usize {
        self.data.as_ref().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_eos(&self) -> bool {
        self.data.is_none() || self.flags.is_eos()
    }

    pub fn info(&self) -> SampleInfo {
        SampleInfo::new(self.size(), self.pts_us, self.flags)
    }
}

impl From<(Bytes, SampleInfo)> for EncodedUnit {
    fn from((data, info): (Bytes, SampleInfo)) -> Self {
        Self {
            data: Some(data),
            pts_us: info.pts_us,
            flags: info.flags,
        }
    }
}
