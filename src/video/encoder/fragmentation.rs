//! Annex-B fragmentation table
//!
//! Scans an H.264 byte stream for `00 00 01` and `00 00 00 01` start codes
//! and records where each unit's payload begins and how long it is. The
//! scan runs twice: the first pass counts units so the table is allocated
//! once, the second fills offsets and lengths.

/// One unit inside an encoded payload, start code excluded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    pub offset: usize,
    pub length: usize,
}

/// Unit boundaries of one encoded payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FragmentationHeader {
    fragments: Vec<Fragment>,
}

impl FragmentationHeader {
    /// Build the table for an Annex-B payload
    pub fn from_annex_b(data: &[u8]) -> Self {
        let count = scan(data, |_, _| {});
        let mut fragments = Vec::with_capacity(count);
        scan(data, |offset, _| {
            fragments.push(Fragment { offset, length: 0 })
        });

        for i in 0..fragments.len() {
            let end = match fragments.get(i + 1) {
                Some(next) => next.offset - start_code_len_before(data, next.offset),
                None => data.len(),
            };
            fragments[i].length = end - fragments[i].offset;
        }

        Self { fragments }
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Payload slices of each unit
    pub fn units<'a>(&'a self, data: &'a [u8]) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.fragments
            .iter()
            .map(move |f| &data[f.offset..f.offset + f.length])
    }
}

/// Visit the payload offset of each unit; returns the unit count
///
/// A 3-byte start code needs at least one payload byte after it, as does a
/// 4-byte one.
fn scan(data: &[u8], mut visit: impl FnMut(usize, usize)) -> usize {
    let len = data.len();
    let mut count = 0;
    let mut i = 0;
    while i + 3 < len {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                visit(i + 3, 3);
                count += 1;
                i += 3;
                continue;
            }
            if i + 4 < len && data[i + 2] == 0 && data[i + 3] == 1 {
                visit(i + 4, 4);
                count += 1;
                i += 4;
                continue;
            }
        }
        i += 1;
    }
    count
}

/// Length of the start code that ends right before `offset`
fn start_code_len_before(data: &[u8], offset: usize) -> usize {
    if offset >= 4 && data[offset - 4..offset] == [0, 0, 0, 1] {
        4
    } else {
        3
    }
}
