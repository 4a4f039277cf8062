//! Object configuration (C1): an immutable description of one erasure-coded
//! object. Grounded directly on the reference `ObjCfg` struct: the same
//! derived sizes, the same URL/file-name construction rules.

#[derive(Clone, Debug)]
pub struct ObjectConfig {
    pub name: String,
    pub nbdata: usize,
    pub nbparity: usize,
    pub nbchunks: usize,
    pub chunksize: usize,
    pub datasize: usize,
    pub paritysize: usize,
    pub blksize: usize,
    /// Placement list: one archive URL per chunk index. `len() >= nbchunks`.
    pub plgr: Vec<String>,
    /// Replacement archives consumed in order during repair redirection.
    pub plgr_replace: Vec<String>,
    /// Optional per-URL query string appended to data URLs.
    pub dtacgi: Vec<Option<String>>,
    /// Optional per-URL query string appended to metadata URLs.
    pub mdtacgi: Vec<Option<String>>,
    /// Suppresses the side-car metadata archive when set.
    pub nomtfile: bool,
}

impl ObjectConfig {
    pub fn new(
        name: impl Into<String>,
        nbdata: usize,
        nbparity: usize,
        chunksize: usize,
        plgr: Vec<String>,
    ) -> Self {
        let nbchunks = nbdata + nbparity;
        assert!(
            plgr.len() >= nbchunks,
            "placement list must have at least nbchunks entries"
        );
        let datasize = nbdata * chunksize;
        let paritysize = nbparity * chunksize;
        let blksize = datasize + paritysize;
        ObjectConfig {
            name: name.into(),
            nbdata,
            nbparity,
            nbchunks,
            chunksize,
            datasize,
            paritysize,
            blksize,
            dtacgi: vec![None; plgr.len()],
            mdtacgi: vec![None; plgr.len()],
            plgr,
            plgr_replace: Vec::new(),
            nomtfile: false,
        }
    }

    pub fn with_replacements(mut self, plgr_replace: Vec<String>) -> Self {
        self.plgr_replace = plgr_replace;
        self
    }

    pub fn with_nomtfile(mut self, nomtfile: bool) -> Self {
        self.nomtfile = nomtfile;
        self
    }

    /// URL of the data archive holding chunk `i`.
    pub fn data_url(&self, i: usize) -> String {
        let base = format!("{}/{}", self.plgr[i], self.name);
        match self.dtacgi.get(i).and_then(|q| q.as_ref()) {
            Some(q) => format!("{base}?{q}"),
            None => base,
        }
    }

    /// URL of the side-car metadata replica at placement index `i`.
    pub fn metadata_url(&self, i: usize) -> String {
        let base = format!("{}/{}.mt", self.plgr[i], self.name);
        match self.mdtacgi.get(i).and_then(|q| q.as_ref()) {
            Some(q) => format!("{base}?{q}"),
            None => base,
        }
    }

    /// URL of the `index`-th replacement archive.
    pub fn replacement_url(&self, index: usize) -> String {
        format!("{}/{}", self.plgr_replace[index], self.name)
    }

    /// Member file name for stripe `strp` of block `blk`: `name.blk.strp`.
    pub fn stripe_file_name(&self, blk: usize, strp: usize) -> String {
        format!("{}.{}.{}", self.name, blk, strp)
    }

    /// CRC32 digest used to validate stripe payloads (CRC32, matching the
    /// archive container's own checksum field so central-directory values
    /// can be compared directly).
    pub fn digest(&self, seed: u32, buf: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new_with_initial(seed);
        hasher.update(buf);
        hasher.finalize()
    }
}

/// Parses the block id out of a stripe file name of the form `name.blk.strp`.
pub fn block_id_from_filename(fn_: &str) -> Option<usize> {
    let mut parts = fn_.rsplitn(3, '.');
    let _strp = parts.next()?;
    let blk = parts.next()?;
    blk.parse::<usize>().ok()
}

/// Parses the stripe id out of a stripe file name of the form `name.blk.strp`.
pub fn stripe_id_from_filename(fn_: &str) -> Option<usize> {
    let mut parts = fn_.rsplitn(3, '.');
    let strp = parts.next()?;
    strp.parse::<usize>().ok()
}
