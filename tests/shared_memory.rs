// Shared memory backend tests for Linux
// Run with: cargo test --test shared_memory -- --nocapture

#[cfg(target_os = "linux")]
mod linux_tests {
    use dmxp_bufferhub::Core::{attach_shared_memory, create_shared_memory, RawHandle};

    #[test]
    fn test_create_shared_memory() {
        let size = 4096;
        let shm = create_shared_memory(size, Some("bufferhub_test_create")).unwrap();

        assert_eq!(shm.size(), size);
        assert!(!shm.as_ptr().is_null());

        // Test writing to the memory
        unsafe {
            let slice = std::slice::from_raw_parts_mut(shm.as_ptr(), size);
            slice[0] = 0x42;
            assert_eq!(slice[0], 0x42);
        }
    }

    #[test]
    fn test_shared_memory_size() {
        let sizes = vec![1024, 4096, 65536, 1024 * 1024];

        for size in sizes {
            let shm = create_shared_memory(size, None).unwrap();
            assert_eq!(shm.size(), size);
        }
    }

    #[test]
    fn test_raw_handle() {
        let shm = create_shared_memory(4096, Some("bufferhub_test_handle")).unwrap();
        let handle = shm.raw_handle();

        match handle {
            RawHandle::Fd(fd) => {
                assert!(fd > 0, "File descriptor should be positive");
            }
        }
    }

    #[test]
    #[serial_test::serial]
    fn test_attach_roundtrip() {
        let size = 8192;
        let shm = create_shared_memory(size, Some("bufferhub_test_attach")).unwrap();

        unsafe {
            let slice = std::slice::from_raw_parts_mut(shm.as_ptr(), size);
            for i in 0..100 {
                slice[i] = (i % 256) as u8;
            }
        }

        // A second mapping of the same name sees the same bytes.
        let view = attach_shared_memory("bufferhub_test_attach", size).unwrap();
        assert!(view.size() >= size);
        unsafe {
            let slice = std::slice::from_raw_parts(view.as_ptr(), size);
            for i in 0..100 {
                assert_eq!(slice[i], (i % 256) as u8);
            }
        }

        // Writes through the second view land in the first.
        unsafe {
            let writer = std::slice::from_raw_parts_mut(view.as_ptr(), size);
            writer[5000] = 0xAB;
            let reader = std::slice::from_raw_parts(shm.as_ptr(), size);
            assert_eq!(reader[5000], 0xAB);
        }
    }

    #[test]
    fn test_attach_missing_region() {
        let result = attach_shared_memory("bufferhub_test_no_such_region", 4096);
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    #[serial_test::serial]
    fn test_attach_too_small() {
        let _shm = create_shared_memory(1024, Some("bufferhub_test_small")).unwrap();
        let result = attach_shared_memory("bufferhub_test_small", 64 * 1024);
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    #[serial_test::serial]
    fn test_shared_block_cross_view() {
        use dmxp_bufferhub::Hub::Buffer::layout::PRODUCER_STATE_BIT;
        use dmxp_bufferhub::Hub::Buffer::SharedBlock;
        use dmxp_bufferhub::Hub::Structs::Buffer_Structs::BufferDescription;

        let description = BufferDescription {
            width: 8,
            height: 8,
            format: 1,
            usage: 0,
            metadata_size: 16,
        };
        let block =
            SharedBlock::allocate(description, 7, Some("bufferhub_test_block_view")).unwrap();

        // A second mapping of the same region observes the header the
        // creator initialized.
        let view = SharedBlock::attach("bufferhub_test_block_view", description).unwrap();
        assert_eq!(view.queue_index(), 7);
        assert_eq!(view.buffer_state(), PRODUCER_STATE_BIT);
        assert_eq!(view.fence_state(), 0);
        assert_eq!(view.data_size(), block.data_size());

        // Data and user metadata written through one view land in the other.
        unsafe {
            let data = std::slice::from_raw_parts_mut(block.data_ptr(), block.data_size());
            data[0] = 0xCD;
            let meta = std::slice::from_raw_parts_mut(
                block.user_metadata_ptr(),
                block.user_metadata_size(),
            );
            meta[0] = 0xEF;

            let data_view = std::slice::from_raw_parts(view.data_ptr(), view.data_size());
            assert_eq!(data_view[0], 0xCD);
            let meta_view =
                std::slice::from_raw_parts(view.user_metadata_ptr(), view.user_metadata_size());
            assert_eq!(meta_view[0], 0xEF);
        }
    }

    #[test]
    fn test_mmap_zero_initialized() {
        // Verify mmap'd memory is zero-initialized
        let size = 1024;
        let shm = create_shared_memory(size, Some("bufferhub_test_zero")).unwrap();

        unsafe {
            let slice = std::slice::from_raw_parts_mut(shm.as_ptr(), size);
            for i in 0..size {
                assert_eq!(slice[i], 0, "Mmap'd memory should be zero-initialized");
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod non_linux_tests {
    use dmxp_bufferhub::Core::{attach_shared_memory, create_shared_memory};

    #[test]
    fn test_unsupported_platform() {
        let result = create_shared_memory(4096, None);
        assert!(result.is_err());

        if let Err(err) = result {
            assert_eq!(err.kind(), std::io::ErrorKind::Unsupported);
        }
    }

    #[test]
    fn test_attach_unsupported_platform() {
        let result = attach_shared_memory("test", 4096);
        assert!(result.is_err());

        if let Err(err) = result {
            assert_eq!(err.kind(), std::io::ErrorKind::Unsupported);
        }
    }
}
