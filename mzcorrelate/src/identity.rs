/*! The assignment of an [`IonType`] to a row */
use std::collections::BTreeMap;
use std::fmt::Display;
use std::hash::Hash;

use identity_hash::IdentityHashable;

use crate::ion_type::IonType;
use crate::table::RowKey;

/// The arena index of an ion network
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NetworkKey(pub usize);

impl Hash for NetworkKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_usize(self.0)
    }
}

impl IdentityHashable for NetworkKey {}

/// An ionization hypothesis for one row, linked to the rows that support it.
///
/// Identities refer to other rows and networks by key only, the owning
/// [`FeatureTable`](crate::table::FeatureTable) resolves them.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IonIdentity {
    pub ion_type: IonType,
    pub row: RowKey,
    /// The partner rows and the ion type each partner was annotated with
    pub partners: BTreeMap<RowKey, IonType>,
    pub network: Option<NetworkKey>,
    /// The number of lower order multimers found in the fragmentation spectrum
    pub multimer_evidence: u32,
    /// The number of fragmentation spectra confirming the neutral loss
    pub neutral_loss_evidence: u32,
}

impl IonIdentity {
    pub fn new(row: RowKey, ion_type: IonType) -> Self {
        Self {
            ion_type,
            row,
            partners: BTreeMap::new(),
            network: None,
            multimer_evidence: 0,
            neutral_loss_evidence: 0,
        }
    }

    pub fn add_partner(&mut self, row: RowKey, ion_type: IonType) {
        if row != self.row {
            self.partners.insert(row, ion_type);
        }
    }

    pub fn remove_partner(&mut self, row: RowKey) -> Option<IonType> {
        self.partners.remove(&row)
    }

    pub fn partner_count(&self) -> usize {
        self.partners.len()
    }

    /// The number of partners for which `in_scope` holds
    pub fn partner_count_where<F: Fn(RowKey) -> bool>(&self, in_scope: F) -> usize {
        self.partners.keys().filter(|k| in_scope(**k)).count()
    }

    /// Copy the partner links and MS/MS evidence of `other` into `self`
    pub fn merge_links(&mut self, other: &IonIdentity) {
        for (k, v) in other.partners.iter() {
            self.add_partner(*k, v.clone());
        }
        self.multimer_evidence = self.multimer_evidence.max(other.multimer_evidence);
        self.neutral_loss_evidence = self.neutral_loss_evidence.max(other.neutral_loss_evidence);
        if self.network.is_none() {
            self.network = other.network;
        }
    }

    pub fn neutral_mass(&self, mz: f64) -> f64 {
        self.ion_type.neutral_mass(mz)
    }

    pub fn is_charged(&self) -> bool {
        self.ion_type.charge != 0
    }
}

impl Display for IonIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.ion_type)?;
        if let Some(net) = self.network {
            write!(f, " (Net{})", net.0)?;
        }
        if !self.partners.is_empty() {
            write!(f, " identified by ID=")?;
            let mut first = true;
            for k in self.partners.keys() {
                if !first {
                    write!(f, ",")?;
                }
                write!(f, "{}", k.0)?;
                first = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ion_type::IonPart;

    #[test]
    fn test_partners() {
        let h = IonType::from_adduct(IonPart::proton());
        let na = IonType::from_adduct(IonPart::sodium());
        let mut ion = IonIdentity::new(RowKey(3), h);
        ion.add_partner(RowKey(3), na.clone());
        assert_eq!(ion.partner_count(), 0);
        ion.add_partner(RowKey(1), na.clone());
        ion.add_partner(RowKey(5), na);
        assert_eq!(ion.partner_count_where(|k| k.0 < 4), 1);
        assert_eq!(ion.to_string(), "[M+H]+ identified by ID=1,5");
        ion.network = Some(NetworkKey(2));
        assert!(ion.to_string().starts_with("[M+H]+ (Net2)"));
        assert!(ion.remove_partner(RowKey(1)).is_some());
        assert_eq!(ion.partner_count(), 1);
    }
}
