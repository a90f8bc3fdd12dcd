use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    globals::page_size,
    heap::{Heap, MutatorScope, Root},
    kernel::{emulated::EmulatedKernel, Capabilities, Kernel},
    object::{self, init_class, init_header, read_word, write_word, ObjectKind, CLASS_OBJECT_SIZE, HEADER_SIZE},
    page_status::PageState,
    statistics::CompactionStatistics,
    util::{align_up, mmap::MemMap},
    CompactionMode, Config, FaultStrategy, UffdPolicy,
};

/// Nodes have two reference fields, a reference to a byte array and an integer id.
const NODE_SIZE: usize = HEADER_SIZE + 32;
const NODE_REFS: u32 = 0b111;
const ID_FIELD: usize = 3;
const PAYLOAD_FIELD: usize = 2;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn copy_only() -> Capabilities {
    Capabilities {
        minor_fault: false,
        sigbus: false,
        ..Capabilities::full()
    }
}

fn test_config(fault_strategy: FaultStrategy) -> Config {
    Config {
        moving_space_capacity: 8 * 1024 * 1024,
        non_moving_space_capacity: 2 * 1024 * 1024,
        linear_alloc_capacity: 2 * 1024 * 1024,
        tlab_size: 8 * 1024,
        fault_strategy,
        min_from_space_release_size: 0,
        verify: true,
        ..Default::default()
    }
}

fn heap_with(caps: Capabilities, config: Config) -> Arc<Heap> {
    init_logger();
    let kernel: Arc<dyn Kernel> = Arc::new(EmulatedKernel::new(caps));
    Heap::with_kernel(config, kernel).unwrap()
}

fn heap_on(caps: Capabilities, fault_strategy: FaultStrategy) -> Arc<Heap> {
    heap_with(caps, test_config(fault_strategy))
}

struct Graph {
    class: Root,
    entries: Vec<(Root, usize)>,
    edges: Vec<[Option<usize>; 2]>,
    payload: Vec<usize>,
}

fn payload_len(rng: &mut StdRng, id: usize) -> usize {
    match id % 7 {
        // Exactly one page.
        0 => page_size() - HEADER_SIZE,
        // Larger than a page, ending mid-page.
        1 => 2 * page_size() + 100,
        _ => rng.gen_range(0..200),
    }
}

fn alloc_node(scope: &MutatorScope<'_>, graph: &mut Graph, rng: &mut StdRng) -> usize {
    let id = graph.edges.len();
    let len = payload_len(rng, id);
    let node = scope.alloc_instance(scope.root(graph.class)).unwrap();
    scope.set_field(node, ID_FIELD, id);
    if len > 0 {
        let array = scope.alloc_prim_array(len).unwrap();
        scope.write_byte(array, 0, id as u8);
        scope.write_byte(array, len - 1, id as u8);
        scope.set_field(node, PAYLOAD_FIELD, array);
    }
    graph.edges.push([None; 2]);
    graph.payload.push(len);
    node
}

fn build_graph(scope: &MutatorScope<'_>, rng: &mut StdRng, count: usize) -> Graph {
    let class = scope.alloc_class(0, NODE_SIZE, NODE_REFS).unwrap();
    let mut graph = Graph {
        class: scope.new_root(class),
        entries: Vec::new(),
        edges: Vec::new(),
        payload: Vec::new(),
    };
    let mut nodes = Vec::with_capacity(count);
    for _ in 0..count {
        if rng.gen_bool(0.5) {
            let garbage = scope.alloc_prim_array(rng.gen_range(0..3 * page_size())).unwrap();
            if rng.gen_bool(0.3) {
                scope.write_byte(garbage, 0, 0xee);
            }
        }
        nodes.push(alloc_node(scope, &mut graph, rng));
    }
    for id in 0..count {
        for field in 0..2 {
            if rng.gen_bool(0.6) {
                let to = rng.gen_range(0..count);
                graph.edges[id][field] = Some(to);
                scope.set_field(nodes[id], field, nodes[to]);
            }
        }
    }
    for _ in 0..count / 8 {
        let id = rng.gen_range(0..count);
        graph.entries.push((scope.new_root(nodes[id]), id));
    }
    graph
}

/// Walks everything reachable from the graph's roots and checks it against the model. Returns
/// the current address of every reachable node.
fn check_graph(scope: &MutatorScope<'_>, graph: &Graph) -> AHashMap<usize, usize> {
    let class = scope.root(graph.class);
    let mut addrs = AHashMap::new();
    let mut stack: Vec<(usize, usize)> = graph
        .entries
        .iter()
        .map(|(root, id)| (scope.root(*root), *id))
        .collect();
    while let Some((obj, id)) = stack.pop() {
        assert_eq!(scope.class_of(obj), class, "class of node {}", id);
        assert_eq!(scope.get_field(obj, ID_FIELD), id);
        if let Some(&seen) = addrs.get(&id) {
            assert_eq!(seen, obj, "node {} reachable at two addresses", id);
            continue;
        }
        addrs.insert(id, obj);
        let array = scope.get_field(obj, PAYLOAD_FIELD);
        let len = graph.payload[id];
        if len == 0 {
            assert_eq!(array, 0);
        } else {
            assert_eq!(scope.kind_of(array), ObjectKind::PrimArray);
            assert_eq!(scope.length(array), len);
            assert_eq!(scope.read_byte(array, 0), id as u8);
            assert_eq!(scope.read_byte(array, len - 1), id as u8);
        }
        for field in 0..2 {
            let target = scope.get_field(obj, field);
            match graph.edges[id][field] {
                Some(to) => stack.push((target, to)),
                None => assert_eq!(target, 0, "field {} of node {}", field, id),
            }
        }
    }
    addrs
}

/// Rewires some reachable nodes and hangs fresh ones off them.
fn mutate(scope: &MutatorScope<'_>, graph: &mut Graph, rng: &mut StdRng) {
    let reachable = check_graph(scope, graph);
    let ids: Vec<usize> = reachable.keys().copied().collect();
    if ids.is_empty() {
        return;
    }
    for _ in 0..16 {
        let from = ids[rng.gen_range(0..ids.len())];
        let field = rng.gen_range(0..2);
        if rng.gen_bool(0.2) {
            graph.edges[from][field] = None;
            scope.set_field(reachable[&from], field, 0);
        } else {
            let to = ids[rng.gen_range(0..ids.len())];
            graph.edges[from][field] = Some(to);
            scope.set_field(reachable[&from], field, reachable[&to]);
        }
    }
    for _ in 0..32 {
        let parent = ids[rng.gen_range(0..ids.len())];
        let field = rng.gen_range(0..2);
        let node = alloc_node(scope, graph, rng);
        let id = graph.edges.len() - 1;
        graph.edges[parent][field] = Some(id);
        scope.set_field(reachable[&parent], field, node);
    }
}

fn run_cycles(heap: &Arc<Heap>, seed: u64, cycles: usize) -> Vec<CompactionStatistics> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mutator = heap.attach_mutator();
    let mut graph = build_graph(&mutator.enter(), &mut rng, 400);
    let mut stats = Vec::new();
    for _ in 0..cycles {
        stats.push(heap.collect().unwrap());
        let scope = mutator.enter();
        check_graph(&scope, &graph);
        mutate(&scope, &mut graph, &mut rng);
    }
    stats
}

#[test]
fn fallback_compaction_preserves_reachability() {
    let heap = heap_on(Capabilities::none(), FaultStrategy::Auto);
    let stats = run_cycles(&heap, 1, 3);
    for s in &stats {
        assert_eq!(s.mode, CompactionMode::Fallback);
        assert!(s.bytes_freed() > 0);
    }
}

#[test]
fn disabled_policy_compacts_in_the_pause() {
    let mut config = test_config(FaultStrategy::Auto);
    config.uffd = UffdPolicy::Disabled;
    let heap = heap_with(Capabilities::full(), config);
    let stats = run_cycles(&heap, 2, 2);
    assert!(stats.iter().all(|s| s.mode == CompactionMode::Fallback));
    assert!(!heap.arena_pool().is_shared());
}

#[test]
fn copy_mode_with_fault_workers() {
    let heap = heap_on(copy_only(), FaultStrategy::Workers(2));
    let stats = run_cycles(&heap, 3, 3);
    for s in &stats {
        assert_eq!(s.mode, CompactionMode::Copy);
        assert!(!s.use_sigbus);
        assert_eq!(s.fault_workers, 2);
        assert_eq!(s.pages_compacted_by_gc + s.pages_compacted_by_mutators, s.pages_compacted);
    }
}

#[test]
fn minor_fault_mode_from_the_second_cycle() {
    let heap = heap_on(Capabilities::full(), FaultStrategy::Workers(1));
    let stats = run_cycles(&heap, 4, 3);
    assert_eq!(stats[0].mode, CompactionMode::Copy);
    assert_eq!(stats[1].mode, CompactionMode::MinorFault);
    assert_eq!(stats[2].mode, CompactionMode::MinorFault);
    assert!(heap.collector().minor_fault_initialized());
}

#[test]
fn sigbus_mode_preserves_reachability() {
    let heap = heap_on(Capabilities::full(), FaultStrategy::Sigbus);
    let stats = run_cycles(&heap, 5, 3);
    assert!(stats.iter().all(|s| s.use_sigbus && s.fault_workers == 0));
    assert_eq!(stats[1].mode, CompactionMode::MinorFault);
}

#[test]
fn sigbus_request_without_support_uses_workers() {
    let heap = heap_on(copy_only(), FaultStrategy::Sigbus);
    let stats = run_cycles(&heap, 6, 1);
    assert!(!stats[0].use_sigbus);
    assert!(stats[0].fault_workers > 0);
}

/// Drives one cycle by hand with `readers` mutator threads walking the graph during the
/// compaction phase. With `sample`, another thread watches every page state of the cycle.
fn collect_with_readers(
    heap: &Arc<Heap>,
    graph: &Graph,
    readers: usize,
    sample: bool,
) -> CompactionStatistics {
    let mut gc = heap.collector();
    gc.initialize_phase().unwrap();
    {
        let _pause = heap.stop_mutators();
        gc.marking_pause(&**heap);
    }
    gc.prepare_for_compaction();
    {
        let _pause = heap.stop_mutators();
        gc.compaction_pause(&**heap);
    }
    let cycle = gc.cycle().cloned().unwrap();
    let done = AtomicBool::new(false);
    std::thread::scope(|s| {
        for _ in 0..readers {
            s.spawn(|| {
                let mutator = heap.attach_mutator();
                check_graph(&mutator.enter(), graph);
            });
        }
        if sample {
            let cycle = &cycle;
            let done = &done;
            s.spawn(move || {
                let mut moving = vec![PageState::Unprocessed; cycle.page_count()];
                let mut linear: Vec<Vec<PageState>> = cycle
                    .linear_alloc_spaces
                    .iter()
                    .map(|space| vec![PageState::Unprocessed; space.status.len()])
                    .collect();
                while !done.load(Ordering::Acquire) {
                    for (idx, last) in moving.iter_mut().enumerate() {
                        let state = cycle.status.state(idx, Ordering::Acquire);
                        assert!(state >= *last, "page {} went from {:?} to {:?}", idx, last, state);
                        *last = state;
                    }
                    for (space, states) in cycle.linear_alloc_spaces.iter().zip(linear.iter_mut()) {
                        for (idx, last) in states.iter_mut().enumerate() {
                            let state = space.status.state(idx, Ordering::Acquire);
                            assert!(state >= *last, "arena page {} went from {:?} to {:?}", idx, last, state);
                            *last = state;
                        }
                    }
                }
            });
        }
        gc.compaction_phase();
        done.store(true, Ordering::Release);
    });
    if cycle.mode.is_concurrent() {
        for idx in 0..cycle.page_count() {
            assert_eq!(cycle.status.state(idx, Ordering::Acquire), PageState::ProcessedAndMapped);
        }
    }
    let stats = gc.finish_phase();
    {
        let _pause = heap.stop_mutators();
        gc.verify_heap(&**heap);
    }
    stats
}

fn readers_during_compaction(heap: Arc<Heap>, seed: u64, cycles: usize, sample: bool) -> Vec<CompactionStatistics> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mutator = heap.attach_mutator();
    let mut graph = build_graph(&mutator.enter(), &mut rng, 300);
    let mut stats = Vec::new();
    for _ in 0..cycles {
        stats.push(collect_with_readers(&heap, &graph, 4, sample));
        let scope = mutator.enter();
        mutate(&scope, &mut graph, &mut rng);
    }
    stats
}

#[test]
fn mutators_fault_in_pages_with_workers() {
    let stats = readers_during_compaction(heap_on(copy_only(), FaultStrategy::Workers(2)), 7, 2, false);
    assert!(stats.iter().all(|s| s.mode == CompactionMode::Copy));
}

#[test]
fn mutators_fault_in_pages_with_sigbus() {
    let stats = readers_during_compaction(heap_on(Capabilities::full(), FaultStrategy::Sigbus), 8, 2, false);
    assert_eq!(stats[0].mode, CompactionMode::Copy);
    assert_eq!(stats[1].mode, CompactionMode::MinorFault);
}

#[test]
fn page_states_only_move_forward() {
    readers_during_compaction(heap_on(Capabilities::full(), FaultStrategy::Workers(2)), 9, 2, true);
    readers_during_compaction(heap_on(Capabilities::full(), FaultStrategy::Sigbus), 10, 2, true);
}

#[test]
fn producing_a_page_twice_gives_identical_bytes() {
    let page = page_size();
    let heap = heap_on(copy_only(), FaultStrategy::Workers(1));
    let mut rng = StdRng::seed_from_u64(11);
    let mutator = heap.attach_mutator();
    let graph = build_graph(&mutator.enter(), &mut rng, 200);
    // Some black allocations so that slid pages are covered too.
    {
        let mut gc = heap.collector();
        gc.initialize_phase().unwrap();
        {
            let _pause = heap.stop_mutators();
            gc.marking_pause(&*heap);
        }
        {
            let scope = mutator.enter();
            for _ in 0..64 {
                let array = scope.alloc_prim_array(rng.gen_range(0..2 * page)).unwrap();
                scope.new_root(array);
            }
        }
        gc.prepare_for_compaction();
        {
            let _pause = heap.stop_mutators();
            gc.compaction_pause(&*heap);
        }
        let cycle = gc.cycle().cloned().unwrap();
        let scratch = MemMap::map_anonymous("idempotence scratch", 2 * page).unwrap();
        let (first, second) = (scratch.begin(), scratch.begin() + page);
        assert!(cycle.black_page_count > 0);
        for idx in 0..cycle.page_count() {
            unsafe {
                cycle.produce_page(idx, first, true);
                // An interrupted earlier attempt left junk behind.
                std::ptr::write_bytes(second as *mut u8, 0x5a, page);
                cycle.produce_page(idx, second, true);
                let a = std::slice::from_raw_parts(first as *const u8, page);
                let b = std::slice::from_raw_parts(second as *const u8, page);
                assert!(a == b, "page {} differs between runs", idx);
            }
        }
        gc.compaction_phase();
        gc.finish_phase();
    }
    check_graph(&mutator.enter(), &graph);
}

#[test]
fn empty_black_pages_are_zero_filled_as_one_run() {
    let page = page_size();
    let mut config = test_config(FaultStrategy::Workers(1));
    config.tlab_size = 4 * page;
    init_logger();
    let kernel = Arc::new(EmulatedKernel::new(copy_only()));
    let heap = Heap::with_kernel(config, kernel.clone()).unwrap();
    let mut rng = StdRng::seed_from_u64(15);
    let mutator = heap.attach_mutator();
    let graph = build_graph(&mutator.enter(), &mut rng, 100);
    {
        let mut gc = heap.collector();
        gc.initialize_phase().unwrap();
        {
            let _pause = heap.stop_mutators();
            gc.marking_pause(&*heap);
        }
        {
            // Each large array forces a new TLAB, leaving the tail of the previous one empty.
            let scope = mutator.enter();
            for _ in 0..2 {
                let small = scope.alloc_prim_array(16).unwrap();
                scope.new_root(small);
                let large = scope.alloc_prim_array(4 * page).unwrap();
                scope.new_root(large);
            }
        }
        gc.prepare_for_compaction();
        {
            let _pause = heap.stop_mutators();
            gc.compaction_pause(&*heap);
        }
        let cycle = gc.cycle().cloned().unwrap();
        let len = cycle.page_count();
        let start = (cycle.first_objs_count..len - 1)
            .find(|&i| cycle.first_objs[i] == 0 && cycle.first_objs[i + 1] == 0)
            .unwrap();
        let run = (start..len).take_while(|&i| cycle.first_objs[i] == 0).count();
        let zeroed = cycle.counters.zero_pages.load(Ordering::Relaxed);
        cycle.concurrently_process_moving_page(cycle.moving_begin() + start * page, None);
        assert_eq!(cycle.counters.zero_pages.load(Ordering::Relaxed) - zeroed, run);
        for idx in start..start + run {
            let addr = cycle.moving_begin() + idx * page;
            assert_eq!(cycle.status.state(idx, Ordering::Acquire), PageState::ProcessedAndMapped);
            assert!(!kernel.is_missing(addr));
            assert_eq!(unsafe { read_word(addr) }, 0);
        }
        if start + run < len {
            assert_eq!(cycle.status.state(start + run, Ordering::Acquire), PageState::Unprocessed);
        }
        gc.compaction_phase();
        gc.finish_phase();
    }
    check_graph(&mutator.enter(), &graph);
}

#[test]
fn four_page_space_compacts_to_a_dense_prefix() {
    let page = page_size();
    let mut config = test_config(FaultStrategy::Workers(1));
    config.moving_space_capacity = 4 * page;
    // A one-word array fills 24 of the 40 bytes, leaving a two word hole.
    config.tlab_size = 40;
    let heap = heap_with(copy_only(), config);
    let space = heap.moving_space();
    let begin = space.begin();

    let a;
    let b;
    unsafe {
        let dead = space.alloc(256).unwrap();
        init_header(dead, 0, ObjectKind::PrimArray, 240);
        a = space.alloc(object::ref_array_size(2)).unwrap();
        init_header(a, 0, ObjectKind::RefArray, 2);
        let gap = begin + 2 * page - 1024 - space.end();
        let filler = space.alloc(gap).unwrap();
        init_header(filler, 0, ObjectKind::PrimArray, (gap - HEADER_SIZE) as u32);
        b = space.alloc(2048).unwrap();
        assert_eq!(b, begin + 2 * page - 1024);
        init_header(b, 0, ObjectKind::PrimArray, 2048 - HEADER_SIZE as u32);
        for i in 0..2048 - HEADER_SIZE {
            ((b + HEADER_SIZE + i) as *mut u8).write((i % 251) as u8);
        }
        write_word(a + HEADER_SIZE, b);
    }
    let mutator = heap.attach_mutator();
    let root_a = mutator.enter().new_root(a);

    let root_c;
    {
        let mut gc = heap.collector();
        gc.initialize_phase().unwrap();
        {
            let _pause = heap.stop_mutators();
            gc.marking_pause(&*heap);
        }
        {
            let scope = mutator.enter();
            let c = scope.alloc_ref_array(1).unwrap();
            assert_eq!(c, begin + 3 * page);
            scope.set_field(c, 0, b);
            root_c = scope.new_root(c);
        }
        gc.prepare_for_compaction();
        {
            let _pause = heap.stop_mutators();
            gc.compaction_pause(&*heap);
        }
        gc.compaction_phase();
        let stats = gc.finish_phase();
        assert_eq!(stats.pages_compacted, 2);
        assert_eq!(stats.black_allocated, 40);
    }

    let scope = mutator.enter();
    let new_a = scope.root(root_a);
    let new_b = begin + object::ref_array_size(2);
    let new_c = scope.root(root_c);
    assert_eq!(new_a, begin);
    assert_eq!(scope.get_field(new_a, 0), new_b);
    assert_eq!(new_c, begin + page);
    assert_eq!(scope.get_field(new_c, 0), new_b);
    assert_eq!(scope.length(new_b), 2048 - HEADER_SIZE);
    for i in 0..2048 - HEADER_SIZE {
        assert_eq!(scope.read_byte(new_b, i), (i % 251) as u8);
    }
    for addr in (new_b + 2048..begin + page).step_by(8) {
        assert_eq!(unsafe { read_word(addr) }, 0, "{:#x} not cleared", addr);
    }
    for addr in (new_c + object::ref_array_size(1)..begin + 2 * page).step_by(8) {
        assert_eq!(unsafe { read_word(addr) }, 0, "{:#x} not cleared", addr);
    }
    assert_eq!(heap.moving_space().end(), begin + page + 40);
}

#[test]
fn from_space_of_a_class_outlives_its_lower_instances() {
    let page = page_size();
    let mut config = test_config(FaultStrategy::Workers(1));
    config.moving_space_capacity = 1024 * 1024;
    let heap = heap_with(copy_only(), config);
    let space = heap.moving_space();
    let mut live = Vec::new();
    let mut alloc_array = |len: usize, tag: Option<u8>| unsafe {
        let array = space.alloc(object::prim_array_size(len)).unwrap();
        init_header(array, 0, ObjectKind::PrimArray, len as u32);
        if let Some(tag) = tag {
            ((array + HEADER_SIZE) as *mut u8).write(tag);
            ((array + HEADER_SIZE + len - 1) as *mut u8).write(tag);
            live.push((array, tag));
        }
    };

    let instance = space.alloc(HEADER_SIZE + 8).unwrap();
    for i in 0..16 {
        alloc_array(page, Some(i));
        alloc_array(page / 2, None);
    }
    let class = space.alloc(CLASS_OBJECT_SIZE).unwrap();
    for i in 16..48 {
        alloc_array(page, Some(i));
        alloc_array(page / 2, None);
    }
    let list = space.alloc(object::ref_array_size(live.len())).unwrap();
    unsafe {
        init_class(class, 0, 0, HEADER_SIZE + 8, 0b1);
        init_header(instance, class, ObjectKind::Instance, 0);
        write_word(instance + HEADER_SIZE, list);
        init_header(list, 0, ObjectKind::RefArray, live.len() as u32);
        for (i, (array, _)) in live.iter().enumerate() {
            write_word(list + HEADER_SIZE + 8 * i, *array);
        }
    }
    let mutator = heap.attach_mutator();
    let root = mutator.enter().new_root(instance);

    let stats = heap.collect().unwrap();
    assert_eq!(stats.mode, CompactionMode::Copy);
    let class_end = align_up(class + CLASS_OBJECT_SIZE, page);
    let released = heap.collector().released_from_space().to_vec();
    let (_, earlier) = released.split_last().expect("no from-space released");
    assert!(!earlier.is_empty());
    for region in earlier {
        assert!(
            region.begin >= class_end,
            "[{:#x}, {:#x}) released while the class at {:#x} was needed",
            region.begin,
            region.end,
            class
        );
    }

    let scope = mutator.enter();
    let instance = scope.root(root);
    let class = scope.class_of(instance);
    assert_eq!(scope.kind_of(class), ObjectKind::Class);
    assert_eq!(unsafe { object::class_info(class).instance_size() } as usize, HEADER_SIZE + 8);
    let list = scope.get_field(instance, 0);
    for (i, (_, tag)) in live.iter().enumerate() {
        let array = scope.get_field(list, i);
        let len = scope.length(array);
        assert_eq!(scope.read_byte(array, 0), *tag);
        assert_eq!(scope.read_byte(array, len - 1), *tag);
    }
}

#[test]
fn arenas_deleted_mid_cycle_are_released_afterwards() {
    let heap = heap_on(copy_only(), FaultStrategy::Workers(1));
    let mutator = heap.attach_mutator();
    let doomed = heap.new_linear_alloc();
    let roots;
    {
        let scope = mutator.enter();
        let class = scope.alloc_class(0, NODE_SIZE, NODE_REFS).unwrap();
        scope.new_root(class);
        roots = scope.alloc_root_array(&doomed, 4).unwrap();
        for i in 0..4 {
            let node = scope.alloc_instance(class).unwrap();
            scope.set_field(node, ID_FIELD, i);
            scope.write_slot(roots.slot(i), node);
        }
    }
    let pool = heap.arena_pool().clone();
    let arena = pool.arenas().into_iter().next().unwrap();
    let replacement = heap.new_linear_alloc();

    {
        let mut gc = heap.collector();
        gc.initialize_phase().unwrap();
        {
            let _pause = heap.stop_mutators();
            gc.marking_pause(&*heap);
        }
        gc.prepare_for_compaction();
        {
            let _pause = heap.stop_mutators();
            gc.compaction_pause(&*heap);
        }
        std::thread::scope(|s| {
            s.spawn(|| {
                let scope = mutator.enter();
                scope.delete_linear_alloc(&doomed).unwrap();
                assert!(arena.is_waiting_for_deletion());
                assert_eq!(pool.unused_arena_count(), 1);
                // The deleted arena is still mapped and not handed out again.
                for i in 0..4 {
                    let value = scope.read_slot(roots.slot(i));
                    assert!(value == 0 || heap.moving_space().has_address(value));
                }
                let array = scope.alloc_root_array(&replacement, 2).unwrap();
                assert!(array.slot(0) >= arena.end() || array.slot(1) < arena.begin());
            });
            gc.compaction_phase();
        });
        assert_eq!(pool.unused_arena_count(), 1);
        gc.finish_phase();
    }
    assert_eq!(pool.unused_arena_count(), 0);
    assert!(pool.arenas().iter().all(|a| a.begin() != arena.begin()));
    let reused = heap.new_linear_alloc();
    let array = mutator.enter().alloc_root_array(&reused, 1).unwrap();
    assert!(array.slot(0) >= arena.begin() && array.slot(0) < arena.end());
}

fn linear_alloc_roots_survive(heap: Arc<Heap>, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mutator = heap.attach_mutator();
    let alloc = heap.new_linear_alloc();
    let (class, array, table, tail, expected) = {
        let scope = mutator.enter();
        let class = scope.alloc_class(0, NODE_SIZE, NODE_REFS).unwrap();
        let class_root = scope.new_root(class);
        let array = scope.alloc_root_array(&alloc, 16).unwrap();
        let table = scope.alloc_root_table(&alloc, 8).unwrap();
        // Bumps on in the arena the first array came from.
        let tail = scope.alloc_root_array(&alloc, 8).unwrap();
        let mut expected = Vec::new();
        for i in 0..32 {
            if rng.gen_bool(0.5) {
                scope.alloc_prim_array(rng.gen_range(0..page_size())).unwrap();
            }
            let node = scope.alloc_instance(class).unwrap();
            scope.set_field(node, ID_FIELD, 1000 + i);
            let slot = match i {
                0..=15 => array.slot(i),
                16..=23 => table.slot(i - 16),
                _ => tail.slot(i - 24),
            };
            scope.write_slot(slot, node);
            expected.push((slot, 1000 + i));
        }
        (class_root, array, table, tail, expected)
    };
    assert!(table.capacity() >= 8);
    assert_eq!(array.len(), 16);
    assert_eq!(tail.slot(0), array.slot(15) + 16);
    for _ in 0..3 {
        heap.collect().unwrap();
        let scope = mutator.enter();
        let class = scope.root(class);
        for (slot, id) in &expected {
            let node = scope.read_slot(*slot);
            assert!(heap.moving_space().has_address(node));
            assert_eq!(scope.class_of(node), class);
            assert_eq!(scope.get_field(node, ID_FIELD), *id);
        }
    }
}

#[test]
fn linear_alloc_roots_are_updated() {
    linear_alloc_roots_survive(heap_on(Capabilities::none(), FaultStrategy::Auto), 12);
    linear_alloc_roots_survive(heap_on(copy_only(), FaultStrategy::Workers(2)), 13);
    linear_alloc_roots_survive(heap_on(Capabilities::full(), FaultStrategy::Sigbus), 14);
}

#[test]
fn non_moving_objects_keep_their_address() {
    let heap = heap_on(Capabilities::full(), FaultStrategy::Workers(1));
    let mutator = heap.attach_mutator();
    let (holder, root) = {
        let scope = mutator.enter();
        let class = scope.alloc_non_moving_class(0, HEADER_SIZE + 16, 0b01).unwrap();
        let holder = scope.alloc_non_moving_instance(class).unwrap();
        let array = scope.alloc_ref_array(3).unwrap();
        let leaf = scope.alloc_prim_array(12).unwrap();
        scope.write_byte(leaf, 11, 0x42);
        scope.set_field(array, 2, leaf);
        scope.set_field(holder, 0, array);
        scope.set_field(holder, 1, 77);
        let root = scope.new_root(holder);
        (holder, root)
    };
    for _ in 0..2 {
        heap.collect().unwrap();
        let scope = mutator.enter();
        assert_eq!(scope.root(root), holder);
        assert_eq!(scope.get_field(holder, 1), 77);
        let array = scope.get_field(holder, 0);
        assert_eq!(scope.length(array), 3);
        assert_eq!(scope.read_byte(scope.get_field(array, 2), 11), 0x42);
    }
}

#[test]
fn unreachable_heap_compacts_to_nothing() {
    let heap = heap_on(copy_only(), FaultStrategy::Workers(1));
    let mutator = heap.attach_mutator();
    {
        let scope = mutator.enter();
        let mut rng = StdRng::seed_from_u64(15);
        let graph = build_graph(&scope, &mut rng, 100);
        scope.release_root(graph.class);
        for (root, _) in graph.entries {
            scope.release_root(root);
        }
    }
    let stats = heap.collect().unwrap();
    assert_eq!(stats.objects_marked, 0);
    assert_eq!(stats.moving_space_after, 0);
    assert_eq!(heap.moving_space().size(), 0);
    // A collection with nothing allocated at all is fine too.
    let stats = heap.collect().unwrap();
    assert_eq!(stats.pages_compacted, 0);
}

#[test]
fn is_marked_reports_new_addresses_while_compacting() {
    let heap = heap_on(copy_only(), FaultStrategy::Workers(1));
    let mutator = heap.attach_mutator();
    let (live, dead) = {
        let scope = mutator.enter();
        let dead = scope.alloc_prim_array(3 * page_size()).unwrap();
        let live = scope.alloc_ref_array(2).unwrap();
        scope.new_root(live);
        (live, dead)
    };
    let mut gc = heap.collector();
    assert_eq!(gc.is_marked(live), Some(live));
    gc.initialize_phase().unwrap();
    {
        let _pause = heap.stop_mutators();
        gc.marking_pause(&*heap);
    }
    assert_eq!(gc.is_marked(dead), None);
    assert_eq!(gc.is_marked(live), Some(live));
    gc.prepare_for_compaction();
    {
        let _pause = heap.stop_mutators();
        gc.compaction_pause(&*heap);
    }
    assert_eq!(gc.is_marked(live), Some(heap.moving_space().begin()));
    assert_eq!(gc.is_marked(dead), None);
    gc.compaction_phase();
    gc.finish_phase();
    let seen: AHashSet<usize> = {
        let mut seen = AHashSet::new();
        heap.moving_space().walk(|obj| {
            seen.insert(obj);
        });
        seen
    };
    assert_eq!(seen.len(), 1);
    assert!(seen.contains(&heap.moving_space().begin()));
}
