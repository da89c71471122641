//! FAT32 file data: chain-following reads and chain-extending writes.

use super::Fat32Volume;
use crate::error::KernelResult;

impl Fat32Volume {
    /// Read `buf.len()` bytes of a file starting at byte `offset`,
    /// clipped to `file_size`. Returns the byte count actually copied;
    /// reads at or past EOF return 0.
    pub fn read_file(
        &self,
        start_cluster: u32,
        file_size: u32,
        offset: u32,
        buf: &mut [u8],
    ) -> KernelResult<usize> {
        if offset >= file_size || start_cluster < 2 {
            return Ok(0);
        }
        let size = (buf.len() as u32).min(file_size - offset);

        let cluster_bytes = self.cluster_bytes() as u32;
        let mut scratch = self.cluster_buf();

        // Walk to the cluster holding `offset`.
        let skip = offset / cluster_bytes;
        let mut cluster = Some(start_cluster);
        for _ in 0..skip {
            cluster = match cluster {
                Some(c) => self.next_cluster(c)?,
                None => return Ok(0),
            };
        }

        let mut copied: u32 = 0;
        let mut in_cluster = offset % cluster_bytes;

        while copied < size {
            let Some(current) = cluster else { break };
            self.read_cluster(current, &mut scratch)?;

            let take = (cluster_bytes - in_cluster).min(size - copied);
            let src = &scratch[in_cluster as usize..(in_cluster + take) as usize];
            buf[copied as usize..(copied + take) as usize].copy_from_slice(src);
            copied += take;
            in_cluster = 0;

            cluster = self.next_cluster(current)?;
        }
        Ok(copied as usize)
    }

    /// Write `data` at byte `offset`, allocating the first cluster for an
    /// empty file and extending the chain as the write runs past it.
    /// Partially-overwritten clusters are read first. `start_cluster` and
    /// `file_size` are updated in place; the directory entry is the
    /// caller's to refresh.
    pub fn write_file(
        &self,
        start_cluster: &mut u32,
        file_size: &mut u32,
        offset: u32,
        data: &[u8],
    ) -> KernelResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        let cluster_bytes = self.cluster_bytes() as u32;
        let mut scratch = self.cluster_buf();

        if *start_cluster < 2 {
            *start_cluster = self.alloc_cluster()?;
        }

        // Walk (and extend) the chain up to the cluster holding `offset`.
        let target_index = offset / cluster_bytes;
        let mut cluster = *start_cluster;
        for _ in 0..target_index {
            cluster = match self.next_cluster(cluster)? {
                Some(next) => next,
                None => {
                    let next = self.alloc_cluster()?;
                    self.set_cluster(cluster, next)?;
                    next
                }
            };
        }

        let mut written: u32 = 0;
        let mut in_cluster = offset % cluster_bytes;

        loop {
            // Preserve the bytes around a partial overwrite.
            if self.read_cluster(cluster, &mut scratch).is_err() {
                scratch.fill(0);
            }

            let take = (cluster_bytes - in_cluster).min(data.len() as u32 - written);
            scratch[in_cluster as usize..(in_cluster + take) as usize]
                .copy_from_slice(&data[written as usize..(written + take) as usize]);
            self.write_cluster(cluster, &scratch)?;
            written += take;
            in_cluster = 0;

            if written as usize >= data.len() {
                break;
            }
            cluster = match self.next_cluster(cluster)? {
                Some(next) => next,
                None => {
                    let next = self.alloc_cluster()?;
                    self.set_cluster(cluster, next)?;
                    next
                }
            };
        }

        if offset + written > *file_size {
            *file_size = offset + written;
        }
        Ok(written as usize)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::vec;

    use super::super::testing::fresh_volume;
    use super::super::dir::Attributes;

    #[test]
    fn write_then_read_round_trips_across_clusters() {
        let (_disk, volume) = fresh_volume();
        let root = volume.root_cluster;
        volume
            .create_entry(root, "test.txt", Attributes::ARCHIVE)
            .expect("create");

        // 3000 bytes spans several 512-byte clusters.
        let payload: vec::Vec<u8> = (0..3000u32).map(|i| (i % 241) as u8).collect();
        let mut cluster = 0u32;
        let mut size = 0u32;
        let written = volume
            .write_file(&mut cluster, &mut size, 0, &payload)
            .expect("write");
        assert_eq!(written, 3000);
        assert_eq!(size, 3000);
        assert!(cluster >= 2, "first cluster was allocated");
        volume
            .update_entry(root, "test.txt", size, cluster)
            .expect("entry refresh");

        // Remount and verify persistence through the directory entry.
        let device = volume.device_for_test();
        drop(volume);
        let volume = super::super::Fat32Volume::mount(device, 0).expect("remount");
        let (entry, _) = volume
            .find_entry(root, "TEST.TXT")
            .expect("walk")
            .expect("entry exists after remount");
        assert!(entry.attr.contains(Attributes::ARCHIVE));
        assert_eq!(entry.size, 3000);
        assert_eq!(
            volume.chain_length(entry.first_cluster).expect("chain"),
            (3000 + 511) / 512
        );

        let mut back = vec![0u8; 3000];
        let read = volume
            .read_file(entry.first_cluster, entry.size, 0, &mut back)
            .expect("read");
        assert_eq!(read, 3000);
        assert_eq!(back, payload);
    }

    #[test]
    fn reads_clip_to_file_size() {
        let (_disk, volume) = fresh_volume();
        let mut cluster = 0u32;
        let mut size = 0u32;
        volume
            .write_file(&mut cluster, &mut size, 0, b"abcdef")
            .expect("write");

        let mut buf = [0u8; 64];
        assert_eq!(
            volume.read_file(cluster, size, 0, &mut buf).expect("read"),
            6
        );
        assert_eq!(&buf[..6], b"abcdef");
        assert_eq!(
            volume.read_file(cluster, size, 6, &mut buf).expect("read at EOF"),
            0
        );
        assert_eq!(
            volume.read_file(cluster, size, 100, &mut buf).expect("read past EOF"),
            0
        );
        let read = volume.read_file(cluster, size, 4, &mut buf).expect("tail");
        assert_eq!(read, 2);
        assert_eq!(&buf[..2], b"ef");
    }

    #[test]
    fn offset_write_extends_size_and_preserves_prefix() {
        let (_disk, volume) = fresh_volume();
        let mut cluster = 0u32;
        let mut size = 0u32;
        volume
            .write_file(&mut cluster, &mut size, 0, b"base")
            .expect("write prefix");

        // Overwrite past the end, inside the same cluster.
        volume
            .write_file(&mut cluster, &mut size, 2, b"YZPQ")
            .expect("overlapping write");
        assert_eq!(size, 6, "write past end grows the file");

        let mut buf = [0u8; 8];
        let read = volume.read_file(cluster, size, 0, &mut buf).expect("read");
        assert_eq!(&buf[..read], b"baYZPQ");
    }

    #[test]
    fn sparse_offset_write_allocates_intermediate_clusters() {
        let (_disk, volume) = fresh_volume();
        let mut cluster = 0u32;
        let mut size = 0u32;
        // Offset two clusters in: the walk must allocate the chain up to
        // the target.
        volume
            .write_file(&mut cluster, &mut size, 1024, b"deep")
            .expect("sparse write");
        assert_eq!(size, 1028);
        assert_eq!(volume.chain_length(cluster).expect("chain"), 3);

        let mut buf = [0u8; 4];
        let read = volume.read_file(cluster, size, 1024, &mut buf).expect("read");
        assert_eq!(&buf[..read], b"deep");
    }
}
