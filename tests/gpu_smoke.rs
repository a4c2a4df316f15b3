//! Device-backed smoke tests. These need a D3D12-capable machine (WARP is
//! enough), so they are ignored by default:
//!
//! ```text
//! cargo test --test gpu_smoke -- --ignored
//! ```

#![cfg(windows)]

use dxr_rhi::rhi::{
    resources::{BufferDesc, BufferUsage},
    CopyBufferInfo, HeapKind, RenderLayer, ResourceStates, NUM_COMMAND_BATCHES,
};

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[test]
#[ignore = "requires a D3D12 device"]
fn begin_end_signals_one_fence_value_per_frame() {
    init_logging();
    let layer = RenderLayer::init(false).unwrap();
    let mut context = layer.create_command_context(None).unwrap();

    assert_eq!(context.fence_value(), 0);

    for frame in 1..=8u64 {
        context.begin().unwrap();
        let signaled = context.end().unwrap();
        assert_eq!(signaled, frame);
        assert_eq!(context.fence_value(), frame);
    }
}

#[test]
#[ignore = "requires a D3D12 device"]
fn ring_never_outruns_the_gpu() {
    init_logging();
    let layer = RenderLayer::init(false).unwrap();
    let mut context = layer.create_command_context(None).unwrap();

    // Spin through far more frames than the ring holds. After every begin,
    // the batch being recorded must have had its previous fence value
    // retired; that is exactly the back-pressure wait.
    for _ in 0..(NUM_COMMAND_BATCHES * 4) {
        context.begin().unwrap();

        let fence_value = context.fence_value();
        if fence_value >= NUM_COMMAND_BATCHES as u64 {
            let must_have_reached = fence_value - (NUM_COMMAND_BATCHES as u64 - 1);
            assert!(context.fence().completed_value() >= must_have_reached);
        }

        context.end().unwrap();
    }
}

#[test]
#[ignore = "requires a D3D12 device"]
fn buffer_upload_round_trips_through_the_gpu() {
    init_logging();
    let layer = RenderLayer::init(false).unwrap();
    let mut context = layer.create_command_context(None).unwrap();

    let data: Vec<u8> = (0u8..=255).collect();

    let readback = layer
        .create_buffer(
            BufferDesc::new(data.len() as u64, BufferUsage::empty())
                .with_heap_kind(HeapKind::Readback),
        )
        .unwrap();

    context.begin().unwrap();

    let buffer = layer
        .create_buffer_with_data(
            BufferDesc::new(data.len() as u64, BufferUsage::ShaderResource),
            &data,
            &mut context,
        )
        .unwrap();

    context.transition_buffer(&buffer, buffer.resting_state(), ResourceStates::CopySrc);
    context.copy_buffer(
        &readback,
        &buffer,
        CopyBufferInfo {
            source_offset: 0,
            destination_offset: 0,
            size_in_bytes: data.len() as u64,
        },
    );

    context.end().unwrap();
    context.flush().unwrap();

    let mapped = readback.map::<u8>().unwrap();
    let contents = unsafe { std::slice::from_raw_parts(mapped.as_ptr(), data.len()) }.to_vec();
    readback.unmap();

    assert_eq!(contents, data);
}
