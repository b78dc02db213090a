// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * PLDM firmware update agent: firmware package model and image reader.
 *
 * Copyright (c) 2024 Code Construct
 */

//! Firmware package contents as the update agent consumes them.
//!
//! Package *parsing* lives elsewhere; this module holds the already-parsed
//! device and component tables plus random access to the image bytes.

use enumset::{EnumSet, EnumSetType};
use std::io::Read;
use std::os::unix::fs::FileExt;

use crate::{Error, Result};

/// Component update option bits, from the package component table
#[derive(EnumSetType, Debug)]
pub enum ComponentOption {
    /// Request the FD to update regardless of version comparison
    ForceUpdate = 0,
    /// Use the comparison stamp rather than the version string
    UseComparisonStamp = 1,
}

/// Set of [`ComponentOption`] bits
pub type ComponentOptions = EnumSet<ComponentOption>;

/// One updatable firmware image within a package
#[derive(Debug, Clone)]
pub struct ComponentImage {
    /// Component classification value
    pub classification: u16,
    /// Component identifier
    pub identifier: u16,
    /// Version comparison stamp
    pub comparison_stamp: u32,
    /// Option bits from the component table
    pub options: ComponentOptions,
    /// Requested activation method bits
    pub activation_method: u16,
    /// Byte offset of the image within the package stream
    pub offset: u64,
    /// Image size in bytes
    pub size: u32,
    /// Component version string
    pub version: String,
}

impl ComponentImage {
    /// Key used to look up the device's classification index
    pub fn key(&self) -> (u16, u16) {
        (self.classification, self.identifier)
    }

    /// UpdateOptionFlags for the UpdateComponent request.
    ///
    /// Bit 0 (force update) is carried over from the package options.
    pub fn update_option_flags(&self) -> u32 {
        if self.options.contains(ComponentOption::ForceUpdate) {
            1
        } else {
            0
        }
    }
}

/// A firmware device id record: which components apply to one device
#[derive(Debug, Clone)]
pub struct FwDeviceRecord {
    /// Indices into the package component table, in update order
    pub applicable_components: Vec<usize>,
    /// Opaque package data destined for the device
    pub package_data: Vec<u8>,
    /// Component image set version string
    pub version: String,
}

/// Byte-range access to the package stream
pub trait PackageSource {
    /// Read up to `buf.len()` bytes at `offset`, returning the count read
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize>;
}

impl PackageSource for std::fs::File {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        FileExt::read_at(self, buf, offset)
    }
}

impl PackageSource for Vec<u8> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        let Some(mut src) = usize::try_from(offset)
            .ok()
            .and_then(|o| self.get(o..))
        else {
            return Ok(0);
        };
        src.read(buf)
    }
}

/// A parsed firmware update package
pub struct Package {
    /// Device id records
    pub devices: Vec<FwDeviceRecord>,
    /// Component image table
    pub components: Vec<ComponentImage>,
    source: Box<dyn PackageSource>,
}

impl Package {
    /// Assemble a package from parsed tables and an image byte source
    pub fn new(
        devices: Vec<FwDeviceRecord>,
        components: Vec<ComponentImage>,
        source: Box<dyn PackageSource>,
    ) -> Result<Self> {
        for dev in &devices {
            if let Some(bad) = dev
                .applicable_components
                .iter()
                .find(|c| **c >= components.len())
            {
                return Err(Error::Package(format!(
                    "device references component {bad} of {}",
                    components.len()
                )));
            }
        }
        Ok(Self { devices, components, source })
    }

    /// Read exactly `buf.len()` bytes of `comp`'s image, starting at
    /// `offset` within the image.
    ///
    /// A read past the end of the package is an error; tail padding for the
    /// final transfer chunk is the caller's concern.
    pub fn read_component(
        &self,
        comp: &ComponentImage,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        let mut pos = comp.offset + offset;
        let mut buf = &mut buf[..];
        while !buf.is_empty() {
            let n = self.source.read_at(pos, buf)?;
            if n == 0 {
                return Err(Error::Package(format!(
                    "short read at package offset {pos}"
                )));
            }
            pos += n as u64;
            buf = &mut buf[n..];
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_component(offset: u64, size: u32) -> ComponentImage {
        ComponentImage {
            classification: 0x000a,
            identifier: 0x0001,
            comparison_stamp: 1,
            options: ComponentOptions::empty(),
            activation_method: 0,
            offset,
            size,
            version: "v1".to_string(),
        }
    }

    #[test]
    fn read_ranges() {
        let bytes: Vec<u8> = (0u8..64).collect();
        let comp = test_component(16, 32);
        let pkg =
            Package::new(Vec::new(), vec![comp.clone()], Box::new(bytes))
                .unwrap();

        let mut buf = [0u8; 8];
        pkg.read_component(&comp, 4, &mut buf).unwrap();
        assert_eq!(buf, [20, 21, 22, 23, 24, 25, 26, 27]);

        // runs off the end of the source
        let mut buf = [0u8; 64];
        assert!(pkg.read_component(&comp, 4, &mut buf).is_err());
    }

    #[test]
    fn bad_component_reference() {
        let rec = FwDeviceRecord {
            applicable_components: vec![1],
            package_data: Vec::new(),
            version: "set-v1".to_string(),
        };
        let res =
            Package::new(vec![rec], vec![test_component(0, 4)], Box::new(vec![]));
        assert!(matches!(res, Err(Error::Package(_))));
    }

    #[test]
    fn update_option_flags() {
        let mut comp = test_component(0, 4);
        assert_eq!(comp.update_option_flags(), 0);
        comp.options |= ComponentOption::ForceUpdate;
        assert_eq!(comp.update_option_flags(), 1);
    }
}
