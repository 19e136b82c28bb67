/// Strata tests
///
/// Everything here runs on the HeadlessDevice, which executes copies
/// when a batch is submitted but only signals the batch fence when told
/// to. That lets each test walk a resource through every load state.
use crate as st;
use st::GpuResource;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A valid SPIR-V header is all the device needs to see
fn fake_spirv() -> Vec<u8> {
    [0x0723_0203u32, 0x0001_0000, 0, 1, 0]
        .iter()
        .flat_map(|w| w.to_le_bytes())
        .collect()
}

fn quad() -> (Vec<st::Vertex>, Vec<u32>) {
    let v = |x, y| st::Vertex::new([x, y, 0.0], [1.0, 0.5, 0.25], [0.0, 0.0, 1.0], [x, y]);
    (
        vec![v(0.0, 0.0), v(1.0, 0.0), v(1.0, 1.0), v(0.0, 1.0)],
        vec![0, 1, 2, 2, 3, 0],
    )
}

fn mesh_blob() -> Vec<u8> {
    let (vertices, indices) = quad();
    let mut blob = Vec::new();
    st::write_mesh_blob(&mut blob, &vertices, &indices).unwrap();
    blob
}

fn texture_blob(width: u32, height: u32) -> (Vec<u8>, Vec<u8>) {
    let texels: Vec<u8> = (0..width * height * 4).map(|i| (i % 251) as u8).collect();
    let mut blob = Vec::new();
    st::write_texture_blob(&mut blob, width, height, &texels).unwrap();
    (blob, texels)
}

fn shader_blob() -> Vec<u8> {
    let mut blob = Vec::new();
    st::write_shader_blob(&mut blob, &fake_spirv(), &fake_spirv()).unwrap();
    blob
}

fn material_bindings() -> Vec<st::BindingDescription> {
    vec![
        st::BindingDescription::parse("albedo", "texture", 0, 1).unwrap(),
        st::BindingDescription::parse("normal_map", "texture", 2, 1).unwrap(),
        st::BindingDescription::parse("time", "float", 1, 1).unwrap(),
        st::BindingDescription::parse("tint", "color", 1, 1).unwrap(),
    ]
}

struct Harness {
    dev: Arc<st::HeadlessDevice>,
    data: Arc<st::MemorySource>,
    ctx: Arc<st::GpuContext>,
    resources: st::ResourceManager,
}

/// Initialize a resource manager on a headless device
fn init_strata() -> Harness {
    utils::logging::init_for_tests();
    let info = st::CreateInfo::builder()
        .arena_chunk_size(4096)
        .arena_chunk_count(64)
        .set_count(2)
        .build();

    let dev = Arc::new(st::HeadlessDevice::new());
    let data = Arc::new(st::MemorySource::new());
    let ctx = Arc::new(st::GpuContext::new(dev.clone(), data.clone(), &info).unwrap());
    let resources = st::ResourceManager::new(ctx.clone()).unwrap();

    Harness {
        dev: dev,
        data: data,
        ctx: ctx,
        resources: resources,
    }
}

#[test]
fn mesh_round_trip() {
    let mut h = init_strata();
    let id = h.data.insert_content(mesh_blob());

    let mesh = h.resources.acquire_mesh(id).unwrap();
    assert_eq!(mesh.vertex_count(), 4);
    assert_eq!(mesh.index_count(), 6);
    assert_eq!(h.resources.state(id), st::ResourceState::LoadRequested);

    // ------------ submit, fence not signaled -------------
    h.resources.update().unwrap();
    assert_eq!(h.resources.state(id), st::ResourceState::Loading);
    assert!(!h.resources.is_loaded(id));

    // ------------ complete -------------
    h.dev.signal_fences();
    h.resources.update().unwrap();
    assert_eq!(h.resources.state(id), st::ResourceState::Loaded);

    let blob = mesh_blob();
    let vertices = h.dev.read_buffer(mesh.vertex_buffer().buffer()).unwrap();
    let indices = h.dev.read_buffer(mesh.index_buffer().buffer()).unwrap();
    assert_eq!(&vertices[..], &blob[8..8 + 176]);
    assert_eq!(&indices[..], &blob[8 + 176..]);
}

#[test]
fn texture_upload_leaves_image_readable() {
    let mut h = init_strata();
    let (blob, texels) = texture_blob(4, 2);
    let id = h.data.insert_content(blob);

    let tex = h.resources.acquire_texture(id).unwrap();
    h.resources.wait_idle().unwrap();

    assert!(tex.is_loaded());
    assert_eq!(h.dev.read_image(tex.image().image()).unwrap(), texels);
    assert_eq!(
        h.dev.image_layout(tex.image().image()),
        Some(st::vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
    );

    // both barriers wrap the copy
    let submissions = h.dev.submissions();
    let cmds = &submissions.last().unwrap().commands;
    assert!(matches!(&cmds[0], st::RecordedCommand::Transition(t)
        if t.new_layout == st::vk::ImageLayout::TRANSFER_DST_OPTIMAL));
    assert!(matches!(&cmds[1], st::RecordedCommand::CopyBufferToImage { .. }));
    assert!(matches!(&cmds[2], st::RecordedCommand::Transition(t)
        if t.new_layout == st::vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL));
}

#[test]
fn shared_resources_are_allocated_once() {
    let mut h = init_strata();
    let id = h.data.insert_content(mesh_blob());
    let baseline = h.ctx.heap().stats();

    let first = h.resources.acquire_mesh(id).unwrap();
    let second = h.resources.acquire_mesh(id).unwrap();
    assert_eq!(first, second);
    assert_eq!(h.resources.ref_count(id), 2);
    h.resources.wait_idle().unwrap();

    // vertex and index buffers, staging is gone
    let loaded = h.ctx.heap().stats();
    assert_eq!(loaded.live_allocations, baseline.live_allocations + 2);

    drop(first);
    h.resources.release_mesh(id).unwrap();
    assert_eq!(h.resources.ref_count(id), 1);
    assert!(h.resources.is_loaded(id));
    assert_eq!(h.ctx.heap().stats(), loaded);

    drop(second);
    h.resources.release_mesh(id).unwrap();
    assert_eq!(h.resources.state(id), st::ResourceState::Unloaded);
    assert_eq!(h.ctx.heap().stats().live_allocations, baseline.live_allocations);
    assert_eq!(h.ctx.heap().stats().bytes_in_use, baseline.bytes_in_use);
}

#[test]
fn release_during_load_defers_free() {
    let mut h = init_strata();
    let id = h.data.insert_content(mesh_blob());
    let baseline = h.ctx.heap().stats();
    let buffers = h.dev.live_buffer_count();

    let mesh = h.resources.acquire_mesh(id).unwrap();
    let vertex_buffer = mesh.vertex_buffer().buffer();
    drop(mesh);
    h.resources.update().unwrap();

    // The upload is in flight, the transfer still owns the buffers
    h.resources.release_mesh(id).unwrap();
    assert_eq!(h.resources.ref_count(id), 0);
    assert!(h.dev.read_buffer(vertex_buffer).is_some());
    assert!(h.ctx.heap().stats().live_allocations > baseline.live_allocations);

    h.dev.signal_fences();
    assert_eq!(h.resources.update().unwrap(), 2);
    assert!(h.dev.read_buffer(vertex_buffer).is_none());
    assert_eq!(h.dev.live_buffer_count(), buffers);
    assert_eq!(h.ctx.heap().stats().live_allocations, baseline.live_allocations);
}

#[test]
fn callbacks_wait_for_the_fence() {
    let h = init_strata();
    let heap = h.ctx.heap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut ids = Vec::new();
    for i in 0..2u8 {
        let dst = Arc::new(
            st::Buffer::new(
                heap,
                8,
                st::vk::BufferUsageFlags::TRANSFER_DST,
                st::vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
            .unwrap(),
        );
        let o = order.clone();
        let job = st::TransferJob::buffer_from_bytes(
            heap,
            dst,
            &[i; 8],
            Some(Box::new(move || o.lock().unwrap().push(i))),
        )
        .unwrap();
        ids.push(h.ctx.submit(job));
    }

    h.ctx.update().unwrap();
    assert!(order.lock().unwrap().is_empty());
    assert_eq!(h.ctx.jobs_state(&ids), st::JobState::Submitted);

    // both copies went out in one batch
    let submission = h.dev.submissions().last().unwrap().clone();
    assert_eq!(submission.commands.len(), 2);

    h.ctx.update().unwrap();
    assert!(order.lock().unwrap().is_empty());

    h.dev.signal_fences();
    assert_eq!(h.ctx.update().unwrap(), 2);
    assert_eq!(*order.lock().unwrap(), vec![0, 1]);
    assert_eq!(h.ctx.jobs_state(&ids), st::JobState::Completed);
}

#[test]
fn material_lifecycle() {
    let mut h = init_strata();
    let shader_id = h.data.insert_content(shader_blob());
    let (blob, _) = texture_blob(2, 2);
    let albedo_id = h.data.insert_content(blob);
    let shared_id = st::ResourceId::new();
    let material_id = st::ResourceId::new();

    let shared = h
        .resources
        .acquire_shared_material(
            shared_id,
            &st::SharedMaterialDesc {
                shader: shader_id,
                bindings: material_bindings(),
            },
        )
        .unwrap();
    let hash = shared.layout_hash();
    let registry = h.ctx.registry().clone();
    assert_eq!(registry.ref_count(hash), 1);
    assert_eq!(h.resources.ref_count(shader_id), 1);
    drop(shared);

    let mut textures = HashMap::new();
    textures.insert("albedo".to_string(), albedo_id);
    let material = h
        .resources
        .acquire_material(
            material_id,
            &st::MaterialDesc {
                shared: shared_id,
                textures: textures,
            },
        )
        .unwrap();
    assert_eq!(material.sets().len(), 2);
    assert_eq!(registry.sets_in_use(hash), 2);
    assert_eq!(h.resources.ref_count(shared_id), 2);

    // the unset texture falls back to the default
    let default_view = h.resources.default_texture().view();
    assert_eq!(material.texture("normal_map").unwrap().view(), default_view);
    assert_ne!(material.texture("albedo").unwrap().view(), default_view);
    let writes = h.dev.descriptor_writes();
    assert!(writes.iter().any(|w| w.binding == 2
        && w.resource
            == st::DescriptorResource::Image {
                view: default_view,
                sampler: h.resources.default_texture().sampler(),
            }));

    // uniforms: time at 0, tint at 16
    material.write_uniform("tint", &[7; 16]).unwrap();
    let ubo = material.uniform_buffer(1, 1).unwrap();
    let contents = h.dev.read_buffer(ubo).unwrap();
    assert_eq!(&contents[0..4], &[0; 4]);
    assert_eq!(&contents[16..32], &[7; 16]);
    assert!(material.write_uniform("tint", &[0; 17]).is_err());
    assert!(material.write_uniform("missing", &[0; 4]).is_err());

    assert!(!material.is_loaded());
    h.resources.wait_idle().unwrap();
    assert!(material.is_loaded());
    drop(material);

    // ------------ tear down -------------
    h.resources.release_material(material_id).unwrap();
    assert_eq!(registry.sets_in_use(hash), 0);
    assert_eq!(h.resources.ref_count(albedo_id), 0);
    assert_eq!(h.resources.ref_count(shared_id), 1);

    h.resources.release_shared_material(shared_id).unwrap();
    assert!(!registry.contains(hash));
    assert_eq!(h.resources.ref_count(shader_id), 0);
    assert_eq!(h.dev.live_pool_count(), 0);
    assert_eq!(h.dev.live_layout_count(), 0);
    assert_eq!(h.dev.live_module_count(), 0);
}

#[test]
fn materials_with_one_layout_share_pools() {
    let mut h = init_strata();
    let shader_id = h.data.insert_content(shader_blob());
    let desc = st::SharedMaterialDesc {
        shader: shader_id,
        bindings: material_bindings(),
    };

    let a = st::ResourceId::new();
    let b = st::ResourceId::new();
    let hash = h.resources.acquire_shared_material(a, &desc).unwrap().layout_hash();
    h.resources.acquire_shared_material(b, &desc).unwrap();

    let registry = h.ctx.registry().clone();
    assert_eq!(registry.ref_count(hash), 2);
    assert_eq!(h.resources.ref_count(shader_id), 2);

    let mut instances = Vec::new();
    for shared in [a, b, a, b, a] {
        let id = st::ResourceId::new();
        h.resources
            .acquire_material(
                id,
                &st::MaterialDesc {
                    shared: shared,
                    textures: HashMap::new(),
                },
            )
            .unwrap();
        instances.push(id);
    }
    // ten sets from one group of eight set pools
    assert_eq!(registry.sets_in_use(hash), 10);
    assert_eq!(registry.pool_count(hash), 2);

    for id in instances {
        h.resources.release_material(id).unwrap();
    }
    h.resources.release_shared_material(a).unwrap();
    assert!(registry.contains(hash));
    h.resources.release_shared_material(b).unwrap();
    assert!(!registry.contains(hash));
}

#[test]
fn unknown_texture_binding_is_rejected() {
    let mut h = init_strata();
    let shader_id = h.data.insert_content(shader_blob());
    let (blob, _) = texture_blob(1, 1);
    let tex_id = h.data.insert_content(blob);
    let shared_id = st::ResourceId::new();

    h.resources
        .acquire_shared_material(
            shared_id,
            &st::SharedMaterialDesc {
                shader: shader_id,
                bindings: material_bindings(),
            },
        )
        .unwrap();

    let mut textures = HashMap::new();
    textures.insert("specular".to_string(), tex_id);
    let res = h.resources.acquire_material(
        st::ResourceId::new(),
        &st::MaterialDesc {
            shared: shared_id,
            textures: textures,
        },
    );

    assert!(matches!(res, Err(st::StrataError::UNKNOWN_BINDING(_))));
    assert_eq!(h.resources.ref_count(shared_id), 1);
    assert_eq!(h.resources.ref_count(tex_id), 0);
}

#[test]
fn registry_reference_counting() {
    let dev = Arc::new(st::HeadlessDevice::new());
    let registry = st::BindingSetRegistry::new(dev.clone());
    let layout = st::BindingLayout::new(material_bindings()).unwrap();
    let hash = layout.hash();

    registry.register_pool(hash, &layout).unwrap();
    registry.register_pool(hash, &layout).unwrap();
    registry.unregister_pool(hash).unwrap();
    assert!(registry.contains(hash));

    registry.unregister_pool(hash).unwrap();
    assert!(!registry.contains(hash));
    assert!(registry.is_empty());
    assert_eq!(dev.live_layout_count(), 0);
}

#[test]
fn freed_sets_are_reused() {
    let dev = Arc::new(st::HeadlessDevice::new());
    let registry = st::BindingSetRegistry::new(dev.clone());
    let layout = st::BindingLayout::new(material_bindings()).unwrap();
    let hash = layout.hash();
    registry.register_pool(hash, &layout).unwrap();

    let sets = registry.allocate(hash, 9).unwrap();
    assert_eq!(registry.pool_count(hash), 2);

    registry.free(hash, &sets[3..4]).unwrap();
    let again = registry.allocate(hash, 1).unwrap();
    assert_eq!(again[0], sets[3]);
    assert_eq!(registry.pool_count(hash), 2);

    registry.free(hash, &sets[..3]).unwrap();
    registry.free(hash, &sets[4..]).unwrap();
    registry.free(hash, &again).unwrap();
    registry.unregister_pool(hash).unwrap();
    assert_eq!(dev.live_pool_count(), 0);
}

#[test]
fn broken_blobs_allocate_nothing() {
    let mut h = init_strata();
    let mut blob = mesh_blob();
    blob.truncate(blob.len() - 4);
    let truncated = h.data.insert_content(blob);
    let baseline = h.ctx.heap().stats();

    assert!(h.resources.acquire_mesh(truncated).is_err());
    assert!(matches!(
        h.resources.acquire_texture(st::ResourceId::new()),
        Err(st::StrataError::RESOURCE_NOT_FOUND(_))
    ));

    assert_eq!(h.ctx.heap().stats(), baseline);
    assert_eq!(h.resources.resident_count(), 0);
    assert!(!h.ctx.has_pending_work());
}

#[test]
fn file_database_serves_blobs() {
    let dir = tempfile::tempdir().unwrap();
    let id = st::ResourceId::new();
    std::fs::write(dir.path().join("quad.mesh"), mesh_blob()).unwrap();

    let db = st::FileDatabase::empty(dir.path());
    db.add(id, "quad.mesh");
    db.save().unwrap();

    let db = Arc::new(st::FileDatabase::open(dir.path()).unwrap());
    assert_eq!(db.ids(), vec![id]);

    let info = st::CreateInfo::builder()
        .arena_chunk_size(1024)
        .arena_chunk_count(16)
        .build();
    let dev = Arc::new(st::HeadlessDevice::auto_signal());
    let ctx = Arc::new(st::GpuContext::new(dev, db, &info).unwrap());
    let mut resources = st::ResourceManager::new(ctx).unwrap();

    let mesh = resources.acquire_mesh(id).unwrap();
    resources.update().unwrap();
    resources.update().unwrap();
    assert!(mesh.is_loaded());
    assert_eq!(mesh.index_count(), 6);
}

#[test]
fn database_file_format() {
    let dir = tempfile::tempdir().unwrap();
    let id: st::ResourceId = "{6f1c1d4e-8a55-4f40-9c35-2a0c1e7b9d10}".parse().unwrap();
    std::fs::write(
        dir.path().join("data.db"),
        format!(
            r#"{{"type": "database", "database": [{{"guid": "{}", "path": "a.tex"}}]}}"#,
            id
        ),
    )
    .unwrap();

    let db = st::FileDatabase::open(dir.path()).unwrap();
    assert!(st::DataSource::contains(&db, id));
    assert_eq!(db.path_of(id).unwrap(), dir.path().join("a.tex"));

    std::fs::write(dir.path().join("data.db"), r#"{"type": "scene", "database": []}"#).unwrap();
    assert!(st::FileDatabase::open(dir.path()).is_err());
}

#[test]
fn shutdown_releases_every_device_object() {
    let h = init_strata();
    let dev = h.dev.clone();
    {
        let Harness {
            data,
            ctx,
            mut resources,
            ..
        } = h;
        let mesh_id = data.insert_content(mesh_blob());
        let shader_id = data.insert_content(shader_blob());
        let shared_id = st::ResourceId::new();

        resources.acquire_mesh(mesh_id).unwrap();
        resources
            .acquire_shared_material(
                shared_id,
                &st::SharedMaterialDesc {
                    shader: shader_id,
                    bindings: material_bindings(),
                },
            )
            .unwrap();
        resources
            .acquire_material(
                st::ResourceId::new(),
                &st::MaterialDesc {
                    shared: shared_id,
                    textures: HashMap::new(),
                },
            )
            .unwrap();
        // leave the uploads in flight
        resources.update().unwrap();
        drop(resources);
        drop(ctx);
    }

    assert_eq!(dev.live_buffer_count(), 0);
    assert_eq!(dev.live_image_count(), 0);
    assert_eq!(dev.live_view_count(), 0);
    assert_eq!(dev.live_sampler_count(), 0);
    assert_eq!(dev.live_memory_count(), 0);
    assert_eq!(dev.live_pool_count(), 0);
    assert_eq!(dev.live_layout_count(), 0);
    assert_eq!(dev.live_fence_count(), 0);
    assert_eq!(dev.live_module_count(), 0);
}

#[test]
fn heap_grows_for_large_requests() {
    let dev = Arc::new(st::HeadlessDevice::new());
    let info = st::CreateInfo::builder()
        .arena_chunk_size(256)
        .arena_chunk_count(4)
        .build();
    let heap = st::DeviceHeap::new(dev.clone(), &info).unwrap();
    let reqs = st::vk::MemoryRequirements {
        size: 3000,
        alignment: 256,
        memory_type_bits: 0b11,
    };

    let big = heap
        .allocate_memory(&reqs, st::vk::MemoryPropertyFlags::DEVICE_LOCAL)
        .unwrap();
    let stats = heap.stats();
    assert_eq!(stats.arenas, 1);
    // 3000 bytes is 12 chunks, rounded to 16
    assert_eq!(stats.bytes_reserved, 16 * 256);
    assert_eq!(stats.bytes_in_use, 16 * 256);

    heap.free_memory(big);
    assert_eq!(heap.release_unused_arenas(), 1);
    assert_eq!(dev.live_memory_count(), 0);
}

#[test]
fn heap_fills_first_arena_before_appending() {
    let dev = Arc::new(st::HeadlessDevice::new());
    let info = st::CreateInfo::builder()
        .arena_chunk_size(256)
        .arena_chunk_count(4)
        .build();
    let heap = st::DeviceHeap::new(dev.clone(), &info).unwrap();
    let reqs = st::vk::MemoryRequirements {
        size: 200,
        alignment: 64,
        memory_type_bits: 0b11,
    };
    let alloc = || {
        heap.allocate_memory(&reqs, st::vk::MemoryPropertyFlags::DEVICE_LOCAL)
            .unwrap()
    };

    let mut first: Vec<st::Allocation> = (0..4).map(|_| alloc()).collect();
    for (i, a) in first.iter().enumerate() {
        assert_eq!(a.arena_index(), 0);
        assert_eq!(a.offset(), i as u64 * 256);
    }
    assert_eq!(heap.stats().arenas, 1);

    // arena 0 is full
    let spill = alloc();
    assert_eq!(spill.arena_index(), 1);
    assert_eq!(spill.offset(), 0);
    assert_eq!(heap.stats().arenas, 2);

    // a block freed in arena 0 is preferred over the room in arena 1
    heap.free_memory(first.remove(1));
    let reused = alloc();
    assert_eq!(reused.arena_index(), 0);
    assert_eq!(reused.offset(), 256);

    let next = alloc();
    assert_eq!(next.arena_index(), 1);
    assert_eq!(next.offset(), 256);
    assert_eq!(heap.stats().arenas, 2);
    assert_eq!(heap.stats().live_allocations, 6);

    for a in first.into_iter().chain([spill, reused, next]) {
        heap.free_memory(a);
    }
    assert_eq!(heap.stats().live_allocations, 0);
    assert_eq!(heap.release_unused_arenas(), 2);
    assert_eq!(dev.live_memory_count(), 0);
}

#[test]
fn arena_chunks_must_be_powers_of_two() {
    let dev = Arc::new(st::HeadlessDevice::new());
    let with_size = |size, count| {
        st::CreateInfo::builder()
            .arena_chunk_size(size)
            .arena_chunk_count(count)
            .build()
    };

    assert!(matches!(
        st::DeviceHeap::new(dev.clone(), &with_size(1000, 4)),
        Err(st::StrataError::INVALID_ARENA_SIZE(1000, 4))
    ));
    assert!(matches!(
        st::DeviceHeap::new(dev.clone(), &with_size(0, 4)),
        Err(st::StrataError::INVALID_ARENA_SIZE(0, 4))
    ));
    assert!(matches!(
        st::DeviceHeap::new(dev.clone(), &with_size(256, 6)),
        Err(st::StrataError::INVALID_ARENA_SIZE(256, 6))
    ));

    // the context refuses to start instead of failing on first use
    let data = Arc::new(st::MemorySource::new());
    assert!(st::GpuContext::new(dev.clone(), data, &with_size(0, 64)).is_err());
    assert_eq!(dev.live_memory_count(), 0);
}

#[test]
fn heap_offsets_honor_alignment() {
    let dev = Arc::new(st::HeadlessDevice::new());
    let info = st::CreateInfo::builder()
        .arena_chunk_size(64)
        .arena_chunk_count(64)
        .build();
    let heap = st::DeviceHeap::new(dev.clone(), &info).unwrap();

    let mut live = Vec::new();
    for (size, alignment) in [(256, 256), (100, 64), (256, 256), (32, 512), (1000, 256)] {
        let reqs = st::vk::MemoryRequirements {
            size: size,
            alignment: alignment,
            memory_type_bits: 0b11,
        };
        let a = heap
            .allocate_memory(&reqs, st::vk::MemoryPropertyFlags::DEVICE_LOCAL)
            .unwrap();
        assert_eq!(a.offset() % alignment, 0, "{} byte request misaligned", size);
        assert!(a.size() >= size);
        live.push(a);
    }

    for a in live {
        heap.free_memory(a);
    }
}
