use crate::{
    payload::{PayloadError, Reader},
    CompanyId, ModelKey, UnicastAddr,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub loc: u16,
    pub sig_models: Vec<u16>,
    /// `(company id, model id)`
    pub vendor_models: Vec<(CompanyId, u16)>,
}

/// Composition Data page 0
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositionData {
    pub cid: CompanyId,
    pub pid: u16,
    pub vid: u16,
    pub crpl: u16,
    pub features: u16,
    pub elements: Vec<Element>,
}

impl CompositionData {
    /// Parse a Composition Data Status body, page octet first
    pub fn parse_status(buf: &[u8]) -> Result<Self, PayloadError> {
        let mut r = Reader::new(buf);
        let page = r.u8()?;
        if page != 0 {
            return Err(PayloadError::Field("composition page"));
        }
        Self::parse_page0(r.remaining())
    }

    pub fn parse_page0(buf: &[u8]) -> Result<Self, PayloadError> {
        let mut r = Reader::new(buf);
        let cid = r.u16()?;
        let pid = r.u16()?;
        let vid = r.u16()?;
        let crpl = r.u16()?;
        let features = r.u16()?;

        let mut elements = vec![];
        while !r.remaining().is_empty() {
            let loc = r.u16()?;
            let nums = r.u8()?;
            let numv = r.u8()?;
            let sig_models = (0..nums).map(|_| r.u16()).collect::<Result<Vec<_>, _>>()?;
            let vendor_models = (0..numv)
                .map(|_| Ok((r.u16()?, r.u16()?)))
                .collect::<Result<Vec<_>, PayloadError>>()?;
            elements.push(Element {
                loc,
                sig_models,
                vendor_models,
            });
        }

        if elements.is_empty() {
            return Err(PayloadError::Field("composition without elements"));
        }

        Ok(Self {
            cid,
            pid,
            vid,
            crpl,
            features,
            elements,
        })
    }

    pub fn encode_status(&self) -> Vec<u8> {
        let mut buf = vec![0x00];
        for v in [self.cid, self.pid, self.vid, self.crpl, self.features] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        for e in self.elements.iter() {
            buf.extend_from_slice(&e.loc.to_le_bytes());
            buf.push(e.sig_models.len() as u8);
            buf.push(e.vendor_models.len() as u8);
            for m in e.sig_models.iter() {
                buf.extend_from_slice(&m.to_le_bytes());
            }
            for (c, m) in e.vendor_models.iter() {
                buf.extend_from_slice(&c.to_le_bytes());
                buf.extend_from_slice(&m.to_le_bytes());
            }
        }
        buf
    }

    /// Element addresses follow the primary address in element order
    pub fn models_matching(
        &self,
        primary: UnicastAddr,
        wanted: &[ModelKey],
    ) -> Vec<(UnicastAddr, ModelKey)> {
        let mut out = vec![];
        for (i, e) in self.elements.iter().enumerate() {
            let addr = primary.wrapping_add(i as u16);
            let present = e
                .sig_models
                .iter()
                .map(|&id| ModelKey::sig(id))
                .chain(e.vendor_models.iter().map(|&(c, id)| ModelKey::vendor(c, id)));
            for m in present {
                if wanted.contains(&m) {
                    out.push((addr, m));
                }
            }
        }
        out
    }

    pub fn element_count(&self) -> u8 {
        self.elements.len().min(u8::MAX as usize) as u8
    }
}
